use chrono::{Duration, TimeZone, Utc};
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use trayflow_analytics::{
    aggregate, compute_error_stats, sn_list, AggregationContext, DrillFilters, ErrorStatsContext,
    ErrorStatsRequest, PassRuleTable, SnMetric,
};
use trayflow_core::{AnalyticsConfig, AnnotatedRow, Outcome, TestRow};

const STATIONS: [&str; 5] = ["FLA", "FLB", "FCT", "R_FCT", "NVL"];
const PARTS: [&str; 3] = ["675-24109-0010-TS2", "675-24109-0020-TS2", "699-UNMAPPED-0001"];

/// `serials` serials, each visiting every station once, one in seven failing.
fn bench_rows(serials: usize) -> Vec<TestRow> {
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    let mut rows = Vec::with_capacity(serials * STATIONS.len());
    for s in 0..serials {
        for (i, station) in STATIONS.iter().enumerate() {
            let n = s * STATIONS.len() + i;
            let outcome = if n % 7 == 0 { Outcome::Fail } else { Outcome::Pass };
            let mut row = TestRow::new(
                format!("18{:011}", s),
                PARTS[s % PARTS.len()],
                *station,
                outcome,
                start + Duration::minutes(n as i64),
            )
            .with_tray_id(format!("TRAY-{}", s / 8));
            if outcome == Outcome::Fail {
                row = row.with_error_code(format!("E{}", n % 11));
            }
            rows.push(row);
        }
    }
    rows
}

fn bench_aggregate(c: &mut Criterion) {
    let config = AnalyticsConfig::default();
    let rules = PassRuleTable::from_config(&config).expect("build pass rules");
    let ctx = AggregationContext::from_config(&config, None).expect("build context");
    let rows: Vec<AnnotatedRow> = bench_rows(2_000)
        .into_iter()
        .enumerate()
        .map(|(i, r)| AnnotatedRow::new(r, i % 13 == 0))
        .collect();

    c.bench_function("aggregation/aggregate_10k_rows", |b| {
        b.iter(|| {
            let report = aggregate(black_box(&rows), &rules, &ctx).expect("aggregate");
            black_box(report.value.summary.total);
        });
    });

    let result = aggregate(&rows, &rules, &ctx).expect("aggregate").into_value();
    c.bench_function("aggregation/sn_list_passed", |b| {
        b.iter(|| {
            let items = sn_list(Some(&result), &SnMetric::Passed, &DrillFilters::default())
                .expect("sn list");
            black_box(items.len());
        });
    });
}

fn bench_error_stats(c: &mut Criterion) {
    let ctx = ErrorStatsContext::from_config(&AnalyticsConfig::default(), &ErrorStatsRequest::default())
        .expect("build context");
    let rows = bench_rows(2_000);

    c.bench_function("error_stats/compute_10k_rows", |b| {
        b.iter(|| {
            let report = compute_error_stats(black_box(&rows), &ctx).expect("error stats");
            black_box(report.value.total_fail_events);
        });
    });
}

criterion_group!(benches, bench_aggregate, bench_error_stats);
criterion_main!(benches);
