//! Property-Based Tests for the Aggregation Engine
//!
//! Property: For any batch, every rollup cell SHALL equal the size of the
//! serial list its drill-down returns, and the serialized result SHALL not
//! depend on row order.
//!
//! This validates:
//! - Tray counts partition the tested serials
//! - Reordered batches serialize to identical bytes
//! - Drill-down lists agree with summary, SKU, period, tray and flow cells
//! - The canonical 10-row scenario matches the hand-computed rollup

use proptest::prelude::*;
use std::collections::HashSet;
use trayflow_analytics::{
    aggregate, sn_list, AggregationContext, AggregationResult, DrillFilters, PassRuleTable,
    SnMetric, SplitColumn, SplitSegment, TrayColumn,
};
use trayflow_core::{AnalyticsConfig, AnnotatedRow, ErrorCode, Outcome, TestRow, TraySource};
use trayflow_test_utils::assertions::{assert_error_code, assert_warned};
use trayflow_test_utils::fixtures::{scenario_config, scenario_rows, UNMAPPED};
use trayflow_test_utils::generators::arb_batch;

// ============================================================================
// HELPERS
// ============================================================================

fn annotate(rows: &[TestRow], bonepile: &HashSet<String>) -> Vec<AnnotatedRow> {
    rows.iter()
        .map(|r| AnnotatedRow::new(r.clone(), bonepile.contains(r.serial_key())))
        .collect()
}

fn run(rows: &[TestRow], bonepile: &HashSet<String>, config: &AnalyticsConfig) -> AggregationResult {
    let rules = PassRuleTable::from_config(config).unwrap();
    let ctx = AggregationContext::from_config(config, None).unwrap();
    aggregate(&annotate(rows, bonepile), &rules, &ctx)
        .unwrap()
        .into_value()
}

fn count(result: &AggregationResult, metric: SnMetric, filters: DrillFilters) -> u64 {
    sn_list(Some(result), &metric, &filters).unwrap().len() as u64
}

// ============================================================================
// ARBITRATORS
// ============================================================================

/// A batch, the same batch shuffled, and a bonepile subset of its serials.
fn arb_case() -> impl Strategy<Value = (Vec<TestRow>, Vec<TestRow>, HashSet<String>)> {
    arb_batch(40).prop_flat_map(|rows| {
        let serials: Vec<String> = rows.iter().map(|r| r.serial_number.clone()).collect();
        (
            Just(rows.clone()),
            Just(rows).prop_shuffle(),
            proptest::sample::subsequence(serials.clone(), 0..=serials.len()),
        )
            .prop_map(|(rows, shuffled, bp)| (rows, shuffled, bp.into_iter().collect()))
    })
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #[test]
    fn prop_tray_counts_partition_serials((rows, _, bonepile) in arb_case()) {
        let result = run(&rows, &bonepile, &AnalyticsConfig::default());
        let trays = &result.tray_summary;
        prop_assert_eq!(trays.untrayed, 0);
        let sum: u64 = trays.trays.iter().map(|t| t.passed + t.failed + t.bonepile).sum();
        prop_assert_eq!(sum, result.summary.total);
        prop_assert_eq!(result.summary.passed + result.summary.failed, result.summary.total);
    }

    #[test]
    fn prop_reordered_batch_serializes_identically((rows, shuffled, bonepile) in arb_case()) {
        let cfg = AnalyticsConfig::default();
        let a = serde_json::to_string(&run(&rows, &bonepile, &cfg)).unwrap();
        let b = serde_json::to_string(&run(&shuffled, &bonepile, &cfg)).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_sn_list_matches_every_cell((rows, _, bonepile) in arb_case()) {
        let mut cfg = AnalyticsConfig::default();
        cfg.tray_source = TraySource::RowMetadata;
        let r = run(&rows, &bonepile, &cfg);
        let none = DrillFilters::default;

        prop_assert_eq!(count(&r, SnMetric::Total, none()), r.summary.total);
        prop_assert_eq!(count(&r, SnMetric::Passed, none()), r.summary.passed);
        prop_assert_eq!(count(&r, SnMetric::Failed, none()), r.summary.failed);
        prop_assert_eq!(count(&r, SnMetric::Bonepile, none()), r.summary.bonepile);
        prop_assert_eq!(count(&r, SnMetric::Fresh, none()), r.summary.fresh);

        let split = r.summary.split;
        let cells = [
            (SplitColumn::Tested, SplitSegment::Bonepile, split.tested.bonepile),
            (SplitColumn::Passed, SplitSegment::Fresh, split.passed.fresh),
            (SplitColumn::Failed, SplitSegment::Total, split.failed.total),
        ];
        for (column, segment, expected) in cells {
            prop_assert_eq!(count(&r, SnMetric::TraySplit { column, segment }, none()), expected);
        }

        for sku in &r.sku_rows {
            prop_assert_eq!(count(&r, SnMetric::Total, none().with_sku(&sku.sku)), sku.tested);
            prop_assert_eq!(count(&r, SnMetric::Passed, none().with_sku(&sku.sku)), sku.passed);
        }
        for period in &r.breakdown {
            let f = none().with_period(&period.period);
            prop_assert_eq!(count(&r, SnMetric::Failed, f.clone()), period.failed);
            prop_assert_eq!(count(&r, SnMetric::Fresh, f), period.fresh);
        }
        for tray in &r.tray_summary.trays {
            let f = || none().with_tray(&tray.tray);
            prop_assert_eq!(count(&r, SnMetric::TrayCell { column: TrayColumn::Tested }, f()), tray.tested);
            prop_assert_eq!(count(&r, SnMetric::TrayCell { column: TrayColumn::Passed }, f()), tray.passed);
            prop_assert_eq!(count(&r, SnMetric::TrayCell { column: TrayColumn::Failed }, f()), tray.failed);
            prop_assert_eq!(count(&r, SnMetric::TrayCell { column: TrayColumn::Bonepile }, f()), tray.bonepile);
        }
        for cell in &r.test_flow.totals {
            let f = |o| none().with_station(&cell.station).with_outcome(o);
            prop_assert_eq!(count(&r, SnMetric::StationOutcome, f(Outcome::Pass)), cell.passed);
            prop_assert_eq!(count(&r, SnMetric::StationOutcome, f(Outcome::Fail)), cell.failed);
        }
        for edge in &r.test_flow.edges {
            let metric = SnMetric::FlowEdge { from: edge.from.clone(), to: edge.to.clone() };
            prop_assert_eq!(count(&r, metric, none()), edge.count);
        }
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn test_end_to_end_scenario() {
    let cfg = scenario_config();
    let rules = PassRuleTable::from_config(&cfg).unwrap();
    let ctx = AggregationContext::from_config(&cfg, None).unwrap();
    let rows = AnnotatedRow::fresh_batch(scenario_rows());
    let report = aggregate(&rows, &rules, &ctx).unwrap();
    assert_warned(&report, ErrorCode::ConfigurationGap);

    let r = report.value;
    assert_eq!(r.summary.total, 4);
    assert_eq!(r.summary.passed, 2);
    assert_eq!(r.summary.failed, 2);
    assert_eq!(r.unassigned_part_numbers, vec![UNMAPPED.to_string()]);
    assert_eq!(r.test_flow.stations, vec!["FLA", "FCT"]);

    let passed: Vec<String> = sn_list(Some(&r), &SnMetric::Passed, &DrillFilters::default())
        .unwrap()
        .into_iter()
        .map(|i| i.serial_number)
        .collect();
    assert_eq!(passed, vec!["1830000000001", "1830000000003"]);
}

#[test]
fn test_drill_down_without_query() {
    assert_error_code(
        &sn_list(None, &SnMetric::Total, &DrillFilters::default()),
        ErrorCode::NoActiveQuery,
    );
}
