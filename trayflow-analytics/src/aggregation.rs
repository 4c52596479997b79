//! Aggregation engine.
//!
//! One pass over a row batch produces the summary, tray summary, SKU rows,
//! time breakdown and test flow, plus the per-serial facts the drill-down
//! layer filters on. Every map is ordered, so identical batches serialize to
//! identical bytes.

use crate::pass_rules::{PassRuleTable, PassStation, UnassignedParts};
use crate::timeline::{group_by_serial, SerialTimeline};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use trayflow_core::{
    format_local, AnalyticsConfig, AnnotatedRow, ConfigError, Granularity, Outcome, Report,
    StationOrder, Timestamp, TraySource, TrayflowError, TrayflowResult, Warning,
};

static TS_GROUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bTS(\d+)\b").expect("static regex"));

// ============================================================================
// CONTEXT
// ============================================================================

/// Resolved settings an aggregation run needs.
#[derive(Debug, Clone)]
pub struct AggregationContext {
    pub order: StationOrder,
    pub tz: Tz,
    pub tray_source: TraySource,
    pub granularity: Granularity,
}

impl AggregationContext {
    pub fn from_config(
        config: &AnalyticsConfig,
        granularity: Option<Granularity>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            order: config.station_order(),
            tz: config.tz()?,
            tray_source: config.tray_source,
            granularity: granularity.unwrap_or(config.aggregation),
        })
    }
}

// ============================================================================
// ROLLUP TYPES
// ============================================================================

/// Bonepile / fresh / total counts of one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SplitCounts {
    pub bonepile: u64,
    pub fresh: u64,
    pub total: u64,
}

impl SplitCounts {
    fn add(&mut self, is_bonepile: bool) {
        if is_bonepile {
            self.bonepile += 1;
        } else {
            self.fresh += 1;
        }
        self.total += 1;
    }
}

/// Tested / passed / failed, each split by bonepile membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SummarySplit {
    pub tested: SplitCounts,
    pub passed: SplitCounts,
    pub failed: SplitCounts,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Summary {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub bonepile: u64,
    pub fresh: u64,
    pub pass_rate: f64,
    pub fail_rate: f64,
    pub split: SummarySplit,
}

/// One tray. `passed` and `failed` count fresh serials; bonepile serials
/// count only in `bonepile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrayRow {
    pub tray: String,
    pub tested: u64,
    pub passed: u64,
    pub failed: u64,
    pub bonepile: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TraySummary {
    pub trays: Vec<TrayRow>,
    /// Serials with no tray identifier.
    pub untrayed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkuRow {
    pub sku: String,
    pub tested: u64,
    pub passed: u64,
    pub failed: u64,
    pub bonepile: u64,
    pub pass_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodRow {
    pub period: String,
    pub tested: u64,
    pub passed: u64,
    pub failed: u64,
    pub bonepile: u64,
    pub fresh: u64,
    pub pass_rate: f64,
}

/// Distinct serials whose winning outcome at a station is PASS / FAIL.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StationCell {
    pub station: String,
    pub passed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSkuRow {
    pub sku: String,
    /// `TS<n>` group parsed from the part number.
    pub ts_group: Option<String>,
    pub stations: Vec<StationCell>,
}

/// Transition between consecutive stations; `count` is distinct serials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: String,
    pub to: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestFlow {
    /// Every station seen, canonical order.
    pub stations: Vec<String>,
    pub totals: Vec<StationCell>,
    pub sku_rows: Vec<FlowSkuRow>,
    pub edges: Vec<FlowEdge>,
}

/// Everything the drill-down layer needs to know about one serial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialFacts {
    pub serial_number: String,
    pub part_number: String,
    pub tray: Option<String>,
    pub passed: bool,
    pub bonepile: bool,
    /// Bucket of the serial's final observation.
    pub period: String,
    pub station_outcomes: BTreeMap<String, Outcome>,
    pub path: Vec<String>,
    pub last_station: String,
    pub last_test_time: Timestamp,
    pub last_test_time_local: String,
    pub last_failure_msg: Option<String>,
}

impl SerialFacts {
    pub fn status(&self) -> Outcome {
        if self.passed {
            Outcome::Pass
        } else {
            Outcome::Fail
        }
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.path.windows(2).any(|w| w[0] == from && w[1] == to)
    }
}

/// The "last query result".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub granularity: Granularity,
    pub summary: Summary,
    pub tray_summary: TraySummary,
    pub sku_rows: Vec<SkuRow>,
    pub breakdown: Vec<PeriodRow>,
    pub test_flow: TestFlow,
    pub unassigned_part_numbers: Vec<String>,
    /// Rows without a serial number.
    pub skipped_rows: u64,
    /// One entry per serial, ordered by serial number.
    pub serials: Vec<SerialFacts>,
}

// ============================================================================
// AGGREGATION
// ============================================================================

fn rate(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// `TS<n>` group of a part number.
pub fn ts_group(part_number: &str) -> Option<String> {
    TS_GROUP
        .captures(&part_number.to_uppercase())
        .and_then(|c| c.get(1))
        .map(|m| format!("TS{}", m.as_str()))
}

/// Instant of a serial's final observation.
///
/// The winning row at the resolved pass station when the part is configured
/// and the serial reached it; otherwise the latest observation.
fn final_observation(timeline: &SerialTimeline<'_>, rules: &PassRuleTable, part: &str) -> Timestamp {
    if let PassStation::Station(station) = rules.resolve(part) {
        if let Some(win) = timeline.station_outcomes.winning(&station) {
            return win.test_time;
        }
    }
    timeline.latest_row().test_time
}

fn build_facts(
    timeline: &SerialTimeline<'_>,
    rules: &PassRuleTable,
    ctx: &AggregationContext,
    unassigned: &mut UnassignedParts,
) -> SerialFacts {
    let latest = timeline.latest_row();
    let part_key = latest.part_key();
    let passed = rules.is_passed(&part_key, &timeline.station_outcomes, unassigned);
    let final_at = final_observation(timeline, rules, &part_key);
    SerialFacts {
        serial_number: timeline.serial_number.clone(),
        part_number: latest.sku_label(),
        tray: timeline.tray(ctx.tray_source),
        passed,
        bonepile: timeline.is_bonepile(),
        period: ctx.granularity.key_for(final_at, ctx.tz),
        station_outcomes: timeline
            .station_outcomes
            .iter()
            .map(|e| (e.station.clone(), e.outcome))
            .collect(),
        path: timeline.path(),
        last_station: latest.station_key(),
        last_test_time: latest.test_time,
        last_test_time_local: format_local(latest.test_time, ctx.tz),
        last_failure_msg: timeline.last_failure_msg(),
    }
}

#[derive(Default)]
struct Tally {
    tested: u64,
    passed: u64,
    failed: u64,
    bonepile: u64,
}

impl Tally {
    fn add(&mut self, facts: &SerialFacts) {
        self.tested += 1;
        if facts.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        if facts.bonepile {
            self.bonepile += 1;
        }
    }
}

fn summarize(facts: &[SerialFacts]) -> Summary {
    let mut s = Summary::default();
    for f in facts {
        s.total += 1;
        s.split.tested.add(f.bonepile);
        if f.passed {
            s.passed += 1;
            s.split.passed.add(f.bonepile);
        } else {
            s.failed += 1;
            s.split.failed.add(f.bonepile);
        }
        if f.bonepile {
            s.bonepile += 1;
        } else {
            s.fresh += 1;
        }
    }
    s.pass_rate = rate(s.passed, s.total);
    s.fail_rate = rate(s.failed, s.total);
    s
}

fn tray_summary(facts: &[SerialFacts]) -> TraySummary {
    let mut trays: BTreeMap<&str, TrayRow> = BTreeMap::new();
    let mut untrayed = 0u64;
    for f in facts {
        let Some(tray) = f.tray.as_deref() else {
            untrayed += 1;
            continue;
        };
        let row = trays.entry(tray).or_insert_with(|| TrayRow {
            tray: tray.to_string(),
            tested: 0,
            passed: 0,
            failed: 0,
            bonepile: 0,
        });
        row.tested += 1;
        if f.bonepile {
            row.bonepile += 1;
        } else if f.passed {
            row.passed += 1;
        } else {
            row.failed += 1;
        }
    }
    TraySummary {
        trays: trays.into_values().collect(),
        untrayed,
    }
}

fn sku_rows(facts: &[SerialFacts]) -> Vec<SkuRow> {
    let mut by_sku: BTreeMap<&str, Tally> = BTreeMap::new();
    for f in facts {
        by_sku.entry(f.part_number.as_str()).or_default().add(f);
    }
    let mut rows: Vec<SkuRow> = by_sku
        .into_iter()
        .map(|(sku, t)| SkuRow {
            sku: sku.to_string(),
            tested: t.tested,
            passed: t.passed,
            failed: t.failed,
            bonepile: t.bonepile,
            pass_rate: rate(t.passed, t.tested),
        })
        .collect();
    rows.sort_by(|a, b| b.tested.cmp(&a.tested).then_with(|| a.sku.cmp(&b.sku)));
    rows
}

fn breakdown(facts: &[SerialFacts]) -> Vec<PeriodRow> {
    let mut by_period: BTreeMap<&str, Tally> = BTreeMap::new();
    for f in facts {
        by_period.entry(f.period.as_str()).or_default().add(f);
    }
    by_period
        .into_iter()
        .map(|(period, t)| PeriodRow {
            period: period.to_string(),
            tested: t.tested,
            passed: t.passed,
            failed: t.failed,
            bonepile: t.bonepile,
            fresh: t.tested - t.bonepile,
            pass_rate: rate(t.passed, t.tested),
        })
        .collect()
}

fn station_cells(
    counts: &BTreeMap<String, (u64, u64)>,
    stations: &[String],
) -> Vec<StationCell> {
    stations
        .iter()
        .filter_map(|s| {
            counts.get(s).map(|(p, f)| StationCell {
                station: s.clone(),
                passed: *p,
                failed: *f,
            })
        })
        .collect()
}

fn test_flow(facts: &[SerialFacts], order: &StationOrder) -> TestFlow {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut totals: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    let mut per_sku: BTreeMap<&str, BTreeMap<String, (u64, u64)>> = BTreeMap::new();
    let mut edges: BTreeMap<(String, String), u64> = BTreeMap::new();

    for f in facts {
        seen.extend(f.path.iter().cloned());
        let sku_counts = per_sku.entry(f.part_number.as_str()).or_default();
        for (station, outcome) in &f.station_outcomes {
            let total = totals.entry(station.clone()).or_default();
            let cell = sku_counts.entry(station.clone()).or_default();
            match outcome {
                Outcome::Pass => {
                    total.0 += 1;
                    cell.0 += 1;
                }
                Outcome::Fail => {
                    total.1 += 1;
                    cell.1 += 1;
                }
            }
        }
        let distinct: BTreeSet<(&String, &String)> =
            f.path.windows(2).map(|w| (&w[0], &w[1])).collect();
        for (from, to) in distinct {
            *edges.entry((from.clone(), to.clone())).or_default() += 1;
        }
    }

    let mut stations: Vec<String> = seen.into_iter().collect();
    order.sort(&mut stations);

    let mut edge_rows: Vec<FlowEdge> = edges
        .into_iter()
        .map(|((from, to), count)| FlowEdge { from, to, count })
        .collect();
    edge_rows.sort_by(|a, b| {
        order
            .compare(&a.from, &b.from)
            .then_with(|| order.compare(&a.to, &b.to))
    });

    TestFlow {
        totals: station_cells(&totals, &stations),
        sku_rows: per_sku
            .into_iter()
            .map(|(sku, counts)| FlowSkuRow {
                sku: sku.to_string(),
                ts_group: ts_group(sku),
                stations: station_cells(&counts, &stations),
            })
            .collect(),
        edges: edge_rows,
        stations,
    }
}

/// Aggregate a batch of annotated rows.
///
/// Fails only on an empty batch. Unassigned part numbers and rows without a
/// serial number come back as warnings.
pub fn aggregate(
    rows: &[AnnotatedRow],
    rules: &PassRuleTable,
    ctx: &AggregationContext,
) -> TrayflowResult<Report<AggregationResult>> {
    if rows.is_empty() {
        return Err(TrayflowError::empty_batch("aggregate"));
    }

    let timelines = group_by_serial(rows, &ctx.order);
    let mut unassigned = UnassignedParts::new();
    let facts: Vec<SerialFacts> = timelines
        .serials
        .values()
        .map(|tl| build_facts(tl, rules, ctx, &mut unassigned))
        .collect();

    let result = AggregationResult {
        granularity: ctx.granularity,
        summary: summarize(&facts),
        tray_summary: tray_summary(&facts),
        sku_rows: sku_rows(&facts),
        breakdown: breakdown(&facts),
        test_flow: test_flow(&facts, &ctx.order),
        unassigned_part_numbers: unassigned.into_vec(),
        skipped_rows: timelines.skipped_rows,
        serials: facts,
    };

    tracing::debug!(
        rows = rows.len(),
        serials = result.summary.total,
        passed = result.summary.passed,
        unassigned = result.unassigned_part_numbers.len(),
        "Aggregation completed"
    );

    let mut report = Report::new(result);
    if !report.value.unassigned_part_numbers.is_empty() {
        let part_numbers = report.value.unassigned_part_numbers.clone();
        report.push_warning(Warning::UnassignedPartNumbers { part_numbers });
    }
    if report.value.skipped_rows > 0 {
        report.push_warning(Warning::RowsSkipped {
            count: report.value.skipped_rows,
            reason: "missing serial number".to_string(),
        });
    }
    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================
