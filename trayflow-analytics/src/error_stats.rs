//! Error-stats engine.
//!
//! Works on FAIL events rather than serial outcomes. Each FAIL is closed by the
//! first later PASS of the same serial at the same station group; the gap is
//! its time-to-close (TTC). Per-serial TTC (first FAIL to the PASS that closes
//! the last FAIL) feeds the percentile-per-period table.

use crate::ttc::{round2, DistributionStats, TtcBuckets, OPEN_BUCKET};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use trayflow_core::{
    format_local, station_group, AnalyticsConfig, ConfigError, Granularity, Outcome, Report,
    StationOrder, TestRow, Timestamp, TrayflowError, TrayflowResult, Warning,
};

/// Error key for a FAIL without code or message.
pub const NO_MESSAGE_KEY: &str = "_NO_MSG";

const MESSAGE_PREFIX_CHARS: usize = 80;
const SHORT_MESSAGE_CHARS: usize = 20;

// ============================================================================
// REQUEST / CONTEXT
// ============================================================================

/// Per-call overrides for an error-stats run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStatsRequest {
    pub top_k: Option<usize>,
    /// End of the observation window. Defaults to the latest row in the batch.
    pub window_end: Option<Timestamp>,
    pub granularity: Option<Granularity>,
}

#[derive(Debug, Clone)]
pub struct ErrorStatsContext {
    pub order: StationOrder,
    pub tz: Tz,
    pub top_k: usize,
    pub thresholds: Vec<u32>,
    pub percentile: f64,
    pub granularity: Granularity,
    pub window_end: Option<Timestamp>,
}

impl ErrorStatsContext {
    pub fn from_config(
        config: &AnalyticsConfig,
        request: &ErrorStatsRequest,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            order: config.station_order(),
            tz: config.tz()?,
            top_k: request.top_k.unwrap_or(config.top_k_errors).max(1),
            thresholds: config.ttc_thresholds_minutes.clone(),
            percentile: config.ttc_percentile,
            granularity: request.granularity.unwrap_or(config.aggregation),
            window_end: request.window_end,
        })
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Stable key for a failure: the error code, or one derived from the message.
///
/// Short message prefixes are used verbatim; longer ones are hashed so that
/// messages with run-specific tails still group together.
pub fn error_key(error_code: Option<&str>, failure_msg: Option<&str>) -> String {
    if let Some(code) = error_code.map(str::trim).filter(|c| !c.is_empty()) {
        return code.to_uppercase();
    }
    let msg = failure_msg.map(str::trim).unwrap_or("");
    if msg.is_empty() {
        return NO_MESSAGE_KEY.to_string();
    }
    let prefix: String = msg.chars().take(MESSAGE_PREFIX_CHARS).collect();
    let prefix = prefix.trim();
    if prefix.chars().count() < SHORT_MESSAGE_CHARS {
        return prefix.to_string();
    }
    let digest = Sha256::digest(prefix.as_bytes());
    format!("msg_{}", &hex::encode(digest)[..16])
}

/// One FAIL row, normalized and paired with its clearing PASS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailEvent {
    pub serial_number: String,
    pub part_number: String,
    pub station: String,
    pub station_group: String,
    pub station_instance: Option<String>,
    pub error_code: String,
    pub failure_msg: Option<String>,
    pub fail_time: Timestamp,
    pub fail_time_local: String,
    pub clear_time: Option<Timestamp>,
    pub clear_time_local: Option<String>,
    pub ttc_minutes: Option<f64>,
    /// Histogram label, or `open`.
    pub ttc_bucket: String,
    pub row_index: usize,
}

impl FailEvent {
    pub fn is_open(&self) -> bool {
        self.clear_time.is_none()
    }
}

fn minutes_between(from: Timestamp, to: Timestamp) -> f64 {
    (to - from).num_seconds() as f64 / 60.0
}

/// Pair every FAIL with the first later PASS of the same serial and station group.
pub fn infer_clear_times(rows: &[TestRow], tz: Tz, buckets: &TtcBuckets) -> Vec<FailEvent> {
    let mut passes: HashMap<(String, String), Vec<Timestamp>> = HashMap::new();
    for row in rows.iter().filter(|r| r.outcome == Outcome::Pass) {
        let sn = row.serial_key();
        if sn.is_empty() {
            continue;
        }
        passes
            .entry((sn.to_string(), station_group(&row.station)))
            .or_default()
            .push(row.test_time);
    }
    for times in passes.values_mut() {
        times.sort();
    }

    let mut events: Vec<FailEvent> = rows
        .iter()
        .enumerate()
        .filter(|(_, r)| r.outcome == Outcome::Fail && !r.serial_key().is_empty())
        .map(|(idx, row)| {
            let sn = row.serial_key().to_string();
            let group = station_group(&row.station);
            let clear_time = passes
                .get(&(sn.clone(), group.clone()))
                .and_then(|times| times.iter().find(|t| **t > row.test_time).copied());
            let ttc_minutes = clear_time.map(|c| round2(minutes_between(row.test_time, c)));
            let ttc_bucket = match ttc_minutes {
                Some(m) => buckets.label_of(m).to_string(),
                None => OPEN_BUCKET.to_string(),
            };
            FailEvent {
                serial_number: sn,
                part_number: row.sku_label(),
                station: row.station_key(),
                station_group: group,
                station_instance: row
                    .station_instance
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                error_code: error_key(row.error_code.as_deref(), row.failure_msg.as_deref()),
                failure_msg: row
                    .failure_msg
                    .as_deref()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string),
                fail_time: row.test_time,
                fail_time_local: format_local(row.test_time, tz),
                clear_time,
                clear_time_local: clear_time.map(|c| format_local(c, tz)),
                ttc_minutes,
                ttc_bucket,
                row_index: idx,
            }
        })
        .collect();
    events.sort_by(|a, b| {
        (a.fail_time, &a.serial_number, a.row_index).cmp(&(b.fail_time, &b.serial_number, b.row_index))
    });
    events
}

// ============================================================================
// RESULT TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationFailRow {
    pub station_group: String,
    pub fail_events: u64,
    pub unique_serials: u64,
    /// Share of all fail events, percent, one decimal.
    pub pct_fail_events: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopErrorRow {
    pub error_code: String,
    pub representative_message: String,
    pub fail_events: u64,
    pub unique_serials: u64,
    pub top_station_group: String,
    pub first_seen: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationErrorCell {
    pub station_group: String,
    pub error_code: String,
    pub fail_events: u64,
    pub unique_serials: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHotspot {
    pub station_instance: String,
    pub station_group: String,
    pub fail_events: u64,
    pub unique_serials: u64,
    pub top_error_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCount {
    pub label: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtcOverall {
    pub resolved_events: u64,
    pub open_events: u64,
    pub open_serials: u64,
    pub stats: DistributionStats,
    pub buckets: Vec<BucketCount>,
}

/// TTC of one station group or one error code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtcGroupRow {
    pub key: String,
    pub resolved_events: u64,
    pub open_serials: u64,
    pub stats: DistributionStats,
}

/// Serial-level time to close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialTtc {
    pub serial_number: String,
    pub first_fail: Timestamp,
    pub closed_at: Option<Timestamp>,
    pub ttc_minutes: Option<f64>,
    /// Age at window end, for serials still open.
    pub open_age_minutes: Option<f64>,
    /// Bucket of the first FAIL.
    pub period: String,
}

impl SerialTtc {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtcPeriodRow {
    pub period: String,
    pub resolved: u64,
    pub open: u64,
    /// Percentile over resolved serials only.
    pub stats: DistributionStats,
    pub max_open_age_minutes: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatsResult {
    pub granularity: Granularity,
    pub top_k: usize,
    pub percentile: f64,
    pub window_end: Option<Timestamp>,
    pub total_fail_events: u64,
    pub unique_failed_serials: u64,
    pub fail_by_station: Vec<StationFailRow>,
    pub top_errors: Vec<TopErrorRow>,
    pub station_error: Vec<StationErrorCell>,
    pub station_instances: Vec<InstanceHotspot>,
    pub ttc_overall: TtcOverall,
    pub ttc_by_station: Vec<TtcGroupRow>,
    pub ttc_by_error: Vec<TtcGroupRow>,
    pub ttc_by_period: Vec<TtcPeriodRow>,
    pub serial_ttc: Vec<SerialTtc>,
    /// Every FAIL event, ordered by fail time.
    pub events: Vec<FailEvent>,
}

// ============================================================================
// COMPUTATION
// ============================================================================

fn distinct_serials<'a>(events: impl IntoIterator<Item = &'a FailEvent>) -> u64 {
    events
        .into_iter()
        .map(|e| e.serial_number.as_str())
        .collect::<BTreeSet<_>>()
        .len() as u64
}

fn group_by<'a, K, F>(events: &'a [FailEvent], key: F) -> BTreeMap<K, Vec<&'a FailEvent>>
where
    K: Ord,
    F: Fn(&'a FailEvent) -> K,
{
    let mut out: BTreeMap<K, Vec<&'a FailEvent>> = BTreeMap::new();
    for e in events {
        out.entry(key(e)).or_default().push(e);
    }
    out
}

/// Most frequent value; ties go to the smallest.
fn mode<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let mut counts: BTreeMap<&'a str, u64> = BTreeMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    let mut best: Option<(&'a str, u64)> = None;
    for (v, c) in counts {
        if best.map_or(true, |(_, bc)| c > bc) {
            best = Some((v, c));
        }
    }
    best.map(|(v, _)| v)
}

fn fail_by_station(events: &[FailEvent], order: &StationOrder) -> Vec<StationFailRow> {
    let total = events.len() as f64;
    let mut rows: Vec<StationFailRow> = group_by(events, |e| e.station_group.clone())
        .into_iter()
        .map(|(sg, evs)| StationFailRow {
            pct_fail_events: if total > 0.0 {
                (evs.len() as f64 / total * 1000.0).round() / 10.0
            } else {
                0.0
            },
            fail_events: evs.len() as u64,
            unique_serials: distinct_serials(evs.iter().copied()),
            station_group: sg,
        })
        .collect();
    rows.sort_by(|a, b| order.compare(&a.station_group, &b.station_group));
    rows
}

/// Top-K error codes by fail events.
///
/// Ties go to the code seen first: earliest fail time, then error code. Both
/// are properties of the rows, so the ranking does not depend on row order.
fn top_errors(events: &[FailEvent], order: &StationOrder, k: usize) -> Vec<TopErrorRow> {
    let mut rows: Vec<TopErrorRow> = group_by(events, |e| e.error_code.clone())
        .into_iter()
        .map(|(code, evs)| {
            let first_seen = evs.iter().map(|e| e.fail_time).min().unwrap_or_default();
            let representative_message = mode(evs.iter().filter_map(|e| e.failure_msg.as_deref()))
                .unwrap_or("")
                .to_string();
            let mut by_station: BTreeMap<&str, u64> = BTreeMap::new();
            for e in &evs {
                *by_station.entry(e.station_group.as_str()).or_default() += 1;
            }
            let top_station_group = by_station
                .iter()
                .max_by(|(sa, ca), (sb, cb)| ca.cmp(cb).then_with(|| order.compare(sb, sa)))
                .map(|(s, _)| s.to_string())
                .unwrap_or_default();
            TopErrorRow {
                fail_events: evs.len() as u64,
                unique_serials: distinct_serials(evs.iter().copied()),
                error_code: code,
                representative_message,
                top_station_group,
                first_seen,
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        b.fail_events
            .cmp(&a.fail_events)
            .then_with(|| a.first_seen.cmp(&b.first_seen))
            .then_with(|| a.error_code.cmp(&b.error_code))
    });
    rows.truncate(k);
    rows
}

fn station_error(events: &[FailEvent], top: &[TopErrorRow], order: &StationOrder) -> Vec<StationErrorCell> {
    let codes: BTreeSet<&str> = top.iter().map(|t| t.error_code.as_str()).collect();
    let mut cells: Vec<StationErrorCell> = group_by(events, |e| (e.station_group.clone(), e.error_code.clone()))
        .into_iter()
        .filter(|((_, code), _)| codes.contains(code.as_str()))
        .map(|((sg, code), evs)| StationErrorCell {
            station_group: sg,
            error_code: code,
            fail_events: evs.len() as u64,
            unique_serials: distinct_serials(evs.iter().copied()),
        })
        .collect();
    let rank: HashMap<&str, usize> = top
        .iter()
        .enumerate()
        .map(|(i, t)| (t.error_code.as_str(), i))
        .collect();
    cells.sort_by(|a, b| {
        order
            .compare(&a.station_group, &b.station_group)
            .then_with(|| rank[a.error_code.as_str()].cmp(&rank[b.error_code.as_str()]))
    });
    cells
}

fn station_instances(events: &[FailEvent]) -> Vec<InstanceHotspot> {
    let with_instance: Vec<FailEvent> = events
        .iter()
        .filter(|e| e.station_instance.is_some())
        .cloned()
        .collect();
    let mut rows: Vec<InstanceHotspot> =
        group_by(&with_instance, |e| e.station_instance.clone().unwrap_or_default())
            .into_iter()
            .map(|(instance, evs)| InstanceHotspot {
                station_group: mode(evs.iter().map(|e| e.station_group.as_str()))
                    .unwrap_or("")
                    .to_string(),
                top_error_code: mode(evs.iter().map(|e| e.error_code.as_str()))
                    .unwrap_or("")
                    .to_string(),
                fail_events: evs.len() as u64,
                unique_serials: distinct_serials(evs.iter().copied()),
                station_instance: instance,
            })
            .collect();
    rows.sort_by(|a, b| {
        b.fail_events
            .cmp(&a.fail_events)
            .then_with(|| a.station_instance.cmp(&b.station_instance))
    });
    rows
}

fn ttc_overall(events: &[FailEvent], buckets: &TtcBuckets, p: f64) -> TtcOverall {
    let resolved: Vec<f64> = events.iter().filter_map(|e| e.ttc_minutes).collect();
    let open: Vec<&FailEvent> = events.iter().filter(|e| e.is_open()).collect();
    let mut counts = vec![0u64; buckets.labels().len()];
    for m in &resolved {
        counts[buckets.index_of(*m)] += 1;
    }
    TtcOverall {
        resolved_events: resolved.len() as u64,
        open_events: open.len() as u64,
        open_serials: distinct_serials(open.iter().copied()),
        stats: DistributionStats::from_sample(resolved, p),
        buckets: buckets
            .labels()
            .iter()
            .zip(counts)
            .map(|(label, count)| BucketCount {
                label: label.clone(),
                count,
            })
            .collect(),
    }
}

fn ttc_group_row(key: String, evs: &[&FailEvent], p: f64) -> TtcGroupRow {
    let resolved: Vec<f64> = evs.iter().filter_map(|e| e.ttc_minutes).collect();
    TtcGroupRow {
        key,
        resolved_events: resolved.len() as u64,
        open_serials: distinct_serials(evs.iter().copied().filter(|e| e.is_open())),
        stats: DistributionStats::from_sample(resolved, p),
    }
}

fn ttc_by_station(events: &[FailEvent], order: &StationOrder, p: f64) -> Vec<TtcGroupRow> {
    let mut rows: Vec<TtcGroupRow> = group_by(events, |e| e.station_group.clone())
        .into_iter()
        .map(|(sg, evs)| ttc_group_row(sg, &evs, p))
        .collect();
    rows.sort_by(|a, b| order.compare(&a.key, &b.key));
    rows
}

fn ttc_by_error(events: &[FailEvent], top: &[TopErrorRow], p: f64) -> Vec<TtcGroupRow> {
    let grouped = group_by(events, |e| e.error_code.clone());
    top.iter()
        .filter_map(|t| {
            grouped
                .get(&t.error_code)
                .map(|evs| ttc_group_row(t.error_code.clone(), evs, p))
        })
        .collect()
}

/// First FAIL to the first PASS after the serial's last FAIL.
fn serial_ttc(
    rows: &[TestRow],
    window_end: Timestamp,
    ctx: &ErrorStatsContext,
) -> Vec<SerialTtc> {
    let mut by_serial: BTreeMap<&str, Vec<(Timestamp, usize, Outcome)>> = BTreeMap::new();
    for (idx, row) in rows.iter().enumerate() {
        let sn = row.serial_key();
        if !sn.is_empty() {
            by_serial.entry(sn).or_default().push((row.test_time, idx, row.outcome));
        }
    }
    by_serial
        .into_iter()
        .filter_map(|(sn, mut obs)| {
            obs.sort();
            let first_fail = obs.iter().find(|o| o.2 == Outcome::Fail)?.0;
            let last_fail_pos = obs.iter().rposition(|o| o.2 == Outcome::Fail)?;
            let closed_at = obs[last_fail_pos + 1..]
                .iter()
                .find(|o| o.2 == Outcome::Pass && o.0 > obs[last_fail_pos].0)
                .map(|o| o.0);
            Some(SerialTtc {
                serial_number: sn.to_string(),
                first_fail,
                closed_at,
                ttc_minutes: closed_at.map(|c| round2(minutes_between(first_fail, c))),
                open_age_minutes: match closed_at {
                    Some(_) => None,
                    None => Some(round2(minutes_between(first_fail, window_end).max(0.0))),
                },
                period: ctx.granularity.key_for(first_fail, ctx.tz),
            })
        })
        .collect()
}

fn ttc_by_period(serials: &[SerialTtc], p: f64) -> Vec<TtcPeriodRow> {
    let mut by_period: BTreeMap<&str, Vec<&SerialTtc>> = BTreeMap::new();
    for s in serials {
        by_period.entry(s.period.as_str()).or_default().push(s);
    }
    by_period
        .into_iter()
        .map(|(period, items)| {
            let resolved: Vec<f64> = items.iter().filter_map(|s| s.ttc_minutes).collect();
            let open_ages: Vec<f64> = items.iter().filter_map(|s| s.open_age_minutes).collect();
            TtcPeriodRow {
                period: period.to_string(),
                resolved: resolved.len() as u64,
                open: open_ages.len() as u64,
                stats: DistributionStats::from_sample(resolved, p),
                max_open_age_minutes: open_ages.into_iter().reduce(f64::max),
            }
        })
        .collect()
}

/// Compute error statistics over a batch.
pub fn compute_error_stats(
    rows: &[TestRow],
    ctx: &ErrorStatsContext,
) -> TrayflowResult<Report<ErrorStatsResult>> {
    if rows.is_empty() {
        return Err(TrayflowError::empty_batch("compute_error_stats"));
    }

    let buckets = TtcBuckets::new(&ctx.thresholds);
    let events = infer_clear_times(rows, ctx.tz, &buckets);
    let window_end = ctx
        .window_end
        .or_else(|| rows.iter().map(|r| r.test_time).max());
    let serials = match window_end {
        Some(end) => serial_ttc(rows, end, ctx),
        None => Vec::new(),
    };
    let top = top_errors(&events, &ctx.order, ctx.top_k);

    let result = ErrorStatsResult {
        granularity: ctx.granularity,
        top_k: ctx.top_k,
        percentile: ctx.percentile,
        window_end,
        total_fail_events: events.len() as u64,
        unique_failed_serials: distinct_serials(&events),
        fail_by_station: fail_by_station(&events, &ctx.order),
        station_error: station_error(&events, &top, &ctx.order),
        station_instances: station_instances(&events),
        ttc_overall: ttc_overall(&events, &buckets, ctx.percentile),
        ttc_by_station: ttc_by_station(&events, &ctx.order, ctx.percentile),
        ttc_by_error: ttc_by_error(&events, &top, ctx.percentile),
        ttc_by_period: ttc_by_period(&serials, ctx.percentile),
        top_errors: top,
        serial_ttc: serials,
        events,
    };

    tracing::debug!(
        rows = rows.len(),
        fail_events = result.total_fail_events,
        open_events = result.ttc_overall.open_events,
        "Error stats completed"
    );

    let skipped = rows.iter().filter(|r| r.serial_key().is_empty()).count() as u64;
    let mut report = Report::new(result);
    if skipped > 0 {
        report.push_warning(Warning::RowsSkipped {
            count: skipped,
            reason: "missing serial number".to_string(),
        });
    }
    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================
