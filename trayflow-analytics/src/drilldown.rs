//! Drill-down query layer.
//!
//! Lists are views over the facts retained by the last aggregation or
//! error-stats run. Nothing is re-aggregated, so a list always has as many
//! entries as the rollup cell it was opened from.

use crate::aggregation::{AggregationResult, SerialFacts};
use crate::error_stats::{ErrorStatsResult, FailEvent, SerialTtc};
use crate::ttc::OPEN_BUCKET;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use trayflow_core::{normalize_key, Outcome, QueryError, QueryKind, TrayflowError, TrayflowResult};

/// Bucket selector matching every resolved event.
pub const RESOLVED_BUCKET: &str = "resolved";

// ============================================================================
// AGGREGATION DRILL-DOWN
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitColumn {
    Tested,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitSegment {
    Bonepile,
    Fresh,
    Total,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrayColumn {
    Tested,
    Passed,
    Failed,
    Bonepile,
}

/// Rollup cell to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum SnMetric {
    Total,
    Passed,
    Failed,
    Bonepile,
    Fresh,
    /// Cell of the summary split matrix.
    TraySplit {
        column: SplitColumn,
        segment: SplitSegment,
    },
    /// Column of a tray row; combine with a `tray` filter.
    TrayCell { column: TrayColumn },
    /// Test-flow station cell; needs `station` and `outcome` filters.
    StationOutcome,
    FlowEdge { from: String, to: String },
}

impl SnMetric {
    fn matches(&self, f: &SerialFacts) -> bool {
        match self {
            SnMetric::Total | SnMetric::StationOutcome => true,
            SnMetric::Passed => f.passed,
            SnMetric::Failed => !f.passed,
            SnMetric::Bonepile => f.bonepile,
            SnMetric::Fresh => !f.bonepile,
            SnMetric::TraySplit { column, segment } => {
                let in_column = match column {
                    SplitColumn::Tested => true,
                    SplitColumn::Passed => f.passed,
                    SplitColumn::Failed => !f.passed,
                };
                let in_segment = match segment {
                    SplitSegment::Bonepile => f.bonepile,
                    SplitSegment::Fresh => !f.bonepile,
                    SplitSegment::Total => true,
                };
                in_column && in_segment
            }
            SnMetric::TrayCell { column } => {
                f.tray.is_some()
                    && match column {
                        TrayColumn::Tested => true,
                        TrayColumn::Passed => !f.bonepile && f.passed,
                        TrayColumn::Failed => !f.bonepile && !f.passed,
                        TrayColumn::Bonepile => f.bonepile,
                    }
            }
            SnMetric::FlowEdge { from, to } => f.has_edge(&normalize_key(from), &normalize_key(to)),
        }
    }
}

/// Dimension filters, combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrillFilters {
    pub sku: Option<String>,
    pub period: Option<String>,
    pub station: Option<String>,
    pub outcome: Option<Outcome>,
    pub tray: Option<String>,
}

impl DrillFilters {
    pub fn with_sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }

    pub fn with_period(mut self, period: impl Into<String>) -> Self {
        self.period = Some(period.into());
        self
    }

    pub fn with_station(mut self, station: impl Into<String>) -> Self {
        self.station = Some(station.into());
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_tray(mut self, tray: impl Into<String>) -> Self {
        self.tray = Some(tray.into());
        self
    }

    fn matches(&self, f: &SerialFacts) -> bool {
        if let Some(sku) = &self.sku {
            if normalize_key(&f.part_number) != normalize_key(sku) {
                return false;
            }
        }
        if let Some(period) = &self.period {
            if f.period != period.trim() {
                return false;
            }
        }
        if let Some(tray) = &self.tray {
            match &f.tray {
                Some(t) if normalize_key(t) == normalize_key(tray) => {}
                _ => return false,
            }
        }
        match (&self.station, self.outcome) {
            (Some(station), Some(outcome)) => {
                f.station_outcomes.get(&normalize_key(station)) == Some(&outcome)
            }
            (Some(station), None) => {
                let key = normalize_key(station);
                f.path.iter().any(|s| *s == key)
            }
            (None, Some(outcome)) => f.status() == outcome,
            (None, None) => true,
        }
    }
}

/// One serial in a drill-down list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnListItem {
    pub serial_number: String,
    pub part_number: String,
    pub status: Outcome,
    pub is_bonepile: bool,
    pub last_station: String,
    /// Reporting timezone.
    pub last_test_time: String,
    pub last_failure_msg: Option<String>,
}

impl From<&SerialFacts> for SnListItem {
    fn from(f: &SerialFacts) -> Self {
        Self {
            serial_number: f.serial_number.clone(),
            part_number: f.part_number.clone(),
            status: f.status(),
            is_bonepile: f.bonepile,
            last_station: f.last_station.clone(),
            last_test_time: f.last_test_time_local.clone(),
            last_failure_msg: f.last_failure_msg.clone(),
        }
    }
}

/// Serials behind one aggregation cell, ordered by serial number.
pub fn sn_list(
    result: Option<&AggregationResult>,
    metric: &SnMetric,
    filters: &DrillFilters,
) -> TrayflowResult<Vec<SnListItem>> {
    let result = result.ok_or_else(|| TrayflowError::no_active_query(QueryKind::Aggregation))?;

    if *metric == SnMetric::StationOutcome && (filters.station.is_none() || filters.outcome.is_none()) {
        return Err(QueryError::InvalidFilter {
            field: "station".to_string(),
            reason: "station outcome drill-down needs both station and outcome".to_string(),
        }
        .into());
    }

    // `serials` is built from a BTreeMap, so it is already in serial order.
    let items: Vec<SnListItem> = result
        .serials
        .iter()
        .filter(|f| metric.matches(f) && filters.matches(f))
        .map(SnListItem::from)
        .collect();

    tracing::debug!(metric = ?metric, matched = items.len(), "SN list computed");
    Ok(items)
}

// ============================================================================
// ERROR-STATS DRILL-DOWN
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtcState {
    Resolved,
    Open,
}

impl TtcState {
    fn matches(&self, open: bool) -> bool {
        match self {
            TtcState::Resolved => !open,
            TtcState::Open => open,
        }
    }
}

/// Error-stats cell to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "drill", rename_all = "snake_case")]
pub enum ErrorDrill {
    FailByStation { station_group: String },
    TopError { error_code: String },
    StationError { station_group: String, error_code: String },
    StationInstance { station_instance: String },
    /// Histogram label, `open` or `resolved`.
    TtcBucket { bucket: String },
    TtcByStation { station_group: String, state: TtcState },
    TtcByError { error_code: String, state: TtcState },
    /// Serial-level: one event per serial, its first FAIL.
    TtcPeriod { period: String, state: TtcState },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDrillRequest {
    #[serde(flatten)]
    pub drill: ErrorDrill,
    /// Keep only the latest event per serial.
    #[serde(default)]
    pub unique_serials: bool,
}

impl ErrorDrillRequest {
    pub fn new(drill: ErrorDrill) -> Self {
        Self {
            drill,
            unique_serials: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique_serials = true;
        self
    }

    fn is_open_drill(&self) -> bool {
        match &self.drill {
            ErrorDrill::TtcBucket { bucket } => bucket.trim().eq_ignore_ascii_case(OPEN_BUCKET),
            ErrorDrill::TtcByStation { state, .. }
            | ErrorDrill::TtcByError { state, .. }
            | ErrorDrill::TtcPeriod { state, .. } => *state == TtcState::Open,
            _ => false,
        }
    }
}

/// One fail event in an error-stats drill-down list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailEventItem {
    pub serial_number: String,
    pub part_number: String,
    pub station: String,
    pub station_group: String,
    pub station_instance: Option<String>,
    pub error_code: String,
    pub failure_msg: Option<String>,
    pub fail_time: String,
    pub clear_time: Option<String>,
    pub ttc_minutes: Option<f64>,
    pub ttc_bucket: String,
}

impl From<&FailEvent> for FailEventItem {
    fn from(e: &FailEvent) -> Self {
        Self {
            serial_number: e.serial_number.clone(),
            part_number: e.part_number.clone(),
            station: e.station.clone(),
            station_group: e.station_group.clone(),
            station_instance: e.station_instance.clone(),
            error_code: e.error_code.clone(),
            failure_msg: e.failure_msg.clone(),
            fail_time: e.fail_time_local.clone(),
            clear_time: e.clear_time_local.clone(),
            ttc_minutes: e.ttc_minutes,
            ttc_bucket: e.ttc_bucket.clone(),
        }
    }
}

fn event_matches(drill: &ErrorDrill, e: &FailEvent) -> bool {
    match drill {
        ErrorDrill::FailByStation { station_group } => e.station_group == normalize_key(station_group),
        ErrorDrill::TopError { error_code } => e.error_code == error_code.trim(),
        ErrorDrill::StationError {
            station_group,
            error_code,
        } => e.station_group == normalize_key(station_group) && e.error_code == error_code.trim(),
        ErrorDrill::StationInstance { station_instance } => {
            e.station_instance.as_deref() == Some(station_instance.trim())
        }
        ErrorDrill::TtcBucket { bucket } => {
            let bucket = bucket.trim();
            if bucket.eq_ignore_ascii_case(RESOLVED_BUCKET) {
                !e.is_open()
            } else {
                e.ttc_bucket == bucket
            }
        }
        ErrorDrill::TtcByStation {
            station_group,
            state,
        } => e.station_group == normalize_key(station_group) && state.matches(e.is_open()),
        ErrorDrill::TtcByError { error_code, state } => {
            e.error_code == error_code.trim() && state.matches(e.is_open())
        }
        // Resolved at the serial level, see `serial_level_events`.
        ErrorDrill::TtcPeriod { .. } => false,
    }
}

/// First FAIL event of every serial in a TTC period cell.
fn serial_level_events<'a>(
    result: &'a ErrorStatsResult,
    period: &str,
    state: TtcState,
) -> Vec<&'a FailEvent> {
    let selected: HashMap<&str, &SerialTtc> = result
        .serial_ttc
        .iter()
        .filter(|s| s.period == period.trim() && state.matches(s.is_open()))
        .map(|s| (s.serial_number.as_str(), s))
        .collect();
    let mut first: BTreeMap<&str, &FailEvent> = BTreeMap::new();
    for e in &result.events {
        if selected.contains_key(e.serial_number.as_str()) {
            first.entry(e.serial_number.as_str()).or_insert(e);
        }
    }
    first.into_values().collect()
}

/// Keep the latest event of each serial.
fn collapse_latest(events: Vec<&FailEvent>) -> Vec<&FailEvent> {
    let mut latest: BTreeMap<&str, &FailEvent> = BTreeMap::new();
    for e in events {
        let replace = latest.get(e.serial_number.as_str()).map_or(true, |cur| {
            (cur.fail_time, cur.row_index) <= (e.fail_time, e.row_index)
        });
        if replace {
            latest.insert(e.serial_number.as_str(), e);
        }
    }
    latest.into_values().collect()
}

/// Fail events behind one error-stats cell, ordered by serial then fail time.
pub fn error_sn_list(
    result: Option<&ErrorStatsResult>,
    request: &ErrorDrillRequest,
) -> TrayflowResult<Vec<FailEventItem>> {
    let result = result.ok_or_else(|| TrayflowError::no_active_query(QueryKind::ErrorStats))?;

    let mut events: Vec<&FailEvent> = match &request.drill {
        ErrorDrill::TtcPeriod { period, state } => serial_level_events(result, period, *state),
        drill => result.events.iter().filter(|e| event_matches(drill, e)).collect(),
    };
    if request.unique_serials || request.is_open_drill() {
        events = collapse_latest(events);
    }
    events.sort_by(|a, b| {
        (a.serial_number.as_str(), a.fail_time, a.row_index).cmp(&(
            b.serial_number.as_str(),
            b.fail_time,
            b.row_index,
        ))
    });

    tracing::debug!(drill = ?request.drill, matched = events.len(), "Error SN list computed");
    Ok(events.into_iter().map(FailEventItem::from).collect())
}

// ============================================================================
// TESTS
// ============================================================================
