//! Disposition reconciliation.
//!
//! Reduces a disposition snapshot to one entry per serial, then classifies
//! IGS-owned failing units as waiting on IGS or complete. Year-less `mm/dd`
//! stamps are anchored to the request window.

use crate::cells::{is_pass_status, last_mmdd, last_mmdd_entry};
use crate::parse::{DispositionEntry, DispositionParseResult};
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use trayflow_core::{normalize_key, Granularity, Report, Warning, UNKNOWN_PART};

/// SKU filter value meaning "every SKU".
pub const ALL_SKUS: &str = "__TOTAL__";

/// Dates further than this before the window start belong to the next year.
const YEAR_ROLL_DAYS: i64 = 60;

// ============================================================================
// REQUEST
// ============================================================================

/// Which serials a disposition query considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionScope {
    /// Every serial in the disposition snapshot.
    #[default]
    Registry,
    /// Only serials present in the last aggregation's row set.
    LastQuery,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispositionFilters {
    pub granularity: Granularity,
    pub window_start: Option<NaiveDate>,
    pub window_end: Option<NaiveDate>,
    pub sku: Option<String>,
    pub period: Option<String>,
    /// Year anchor when no window start is given.
    pub reference_date: Option<NaiveDate>,
    pub scope: DispositionScope,
}

impl DispositionFilters {
    pub fn with_window(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.window_start = Some(start);
        self.window_end = Some(end);
        self
    }

    pub fn with_sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }

    pub fn with_period(mut self, period: impl Into<String>) -> Self {
        self.period = Some(period.into());
        self
    }

    pub fn with_scope(mut self, scope: DispositionScope) -> Self {
        self.scope = scope;
        self
    }

    /// Stable cache key for this request.
    pub fn request_key(&self) -> String {
        fn opt<T: ToString>(v: &Option<T>) -> String {
            v.as_ref().map(ToString::to_string).unwrap_or_default()
        }
        format!(
            "{}|{}|{}|{}|{}|{}|{:?}",
            self.granularity,
            opt(&self.window_start),
            opt(&self.window_end),
            self.sku_filter().unwrap_or_default(),
            opt(&self.period),
            opt(&self.reference_date),
            self.scope,
        )
    }

    /// Normalized SKU filter; `None` when every SKU is wanted.
    fn sku_filter(&self) -> Option<String> {
        self.sku
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != ALL_SKUS)
            .map(normalize_key)
    }

    fn in_window(&self, date: NaiveDate) -> bool {
        self.window_start.map_or(true, |s| date >= s) && self.window_end.map_or(true, |e| date <= e)
    }

    fn period_in_window(&self, key: &str) -> bool {
        match (self.window_start, self.window_end) {
            (Some(start), Some(end)) => self.granularity.overlaps(key, start, end),
            (Some(start), None) => self.granularity.overlaps(key, start, NaiveDate::MAX),
            (None, Some(end)) => self.granularity.overlaps(key, NaiveDate::MIN, end),
            (None, None) => true,
        }
    }
}

/// SN-list metrics over a disposition snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionMetric {
    Total,
    Waiting,
    Complete,
    TraysBp,
    AllPassTrays,
}

impl DispositionMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispositionMetric::Total => "total",
            DispositionMetric::Waiting => "waiting",
            DispositionMetric::Complete => "complete",
            DispositionMetric::TraysBp => "trays_bp",
            DispositionMetric::AllPassTrays => "all_pass_trays",
        }
    }
}

// ============================================================================
// RESULT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DispositionSummary {
    pub total: u64,
    pub waiting_igs: u64,
    pub complete: u64,
    pub unique_trays_bp: u64,
    pub all_pass_trays: u64,
    /// Serials considered after scoping.
    pub in_scope_tested: u64,
}

/// Waiting / complete counts under one key (SKU, period or category).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DispositionRow {
    pub key: String,
    pub total: u64,
    pub waiting_igs: u64,
    pub complete: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TraySkuRow {
    pub sku: String,
    pub total_trays: u64,
    pub all_pass_trays: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DispositionStats {
    pub upload_id: Option<String>,
    pub summary: DispositionSummary,
    pub by_sku: Vec<DispositionRow>,
    pub by_period: Vec<DispositionRow>,
    pub tray_by_sku: Vec<TraySkuRow>,
    pub by_category: Vec<DispositionRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispositionSnItem {
    pub sn: String,
    pub last_nv_dispo: String,
    pub last_igs_action: String,
    pub nvpn: String,
    pub status: String,
    pub pic: String,
    pub category: String,
}

impl From<&DispositionEntry> for DispositionSnItem {
    fn from(e: &DispositionEntry) -> Self {
        Self {
            sn: e.sn.clone(),
            last_nv_dispo: last_mmdd_entry(&e.nv_disposition),
            last_igs_action: last_mmdd_entry(&e.igs_action),
            nvpn: e.nvpn.clone(),
            status: e.status.clone(),
            pic: e.pic.clone(),
            category: e.category.clone(),
        }
    }
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

fn sku_label(entry: &DispositionEntry) -> String {
    let key = normalize_key(&entry.nvpn);
    if key.is_empty() {
        UNKNOWN_PART.to_string()
    } else {
        key
    }
}

/// Latest entry per serial: later parse, then later NV stamp, then later row.
fn latest_per_serial(entries: &[DispositionEntry]) -> Vec<&DispositionEntry> {
    let mut latest: HashMap<&str, (usize, &DispositionEntry)> = HashMap::new();
    for (pos, entry) in entries.iter().enumerate() {
        let rank = |e: &DispositionEntry, p: usize| (e.parsed_at, last_mmdd(&e.nv_disposition), p);
        let replace = match latest.get(entry.sn.as_str()) {
            Some((p, cur)) => rank(cur, *p) < rank(entry, pos),
            None => true,
        };
        if replace {
            latest.insert(entry.sn.as_str(), (pos, entry));
        }
    }
    let mut rows: Vec<&DispositionEntry> = latest.into_values().map(|(_, e)| e).collect();
    rows.sort_by(|a, b| a.sn.cmp(&b.sn));
    rows
}

/// Anchor a `(month, day)` stamp to a year.
fn resolve_date(
    (month, day): (u32, u32),
    base_year: i32,
    window_start: Option<NaiveDate>,
) -> Option<NaiveDate> {
    let date = NaiveDate::from_ymd_opt(base_year, month, day)?;
    match window_start {
        Some(start) if date < start - Duration::days(YEAR_ROLL_DAYS) => {
            NaiveDate::from_ymd_opt(base_year + 1, month, day)
        }
        _ => Some(date),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IgsState {
    Waiting,
    Complete,
}

#[derive(Debug, Clone)]
struct Classified<'a> {
    entry: &'a DispositionEntry,
    sku: String,
    period: String,
    state: IgsState,
}

struct Reconciliation<'a> {
    latest: Vec<&'a DispositionEntry>,
    classified: Vec<Classified<'a>>,
    undated: u64,
}

fn reconcile<'a>(
    snapshot: &'a DispositionParseResult,
    filters: &DispositionFilters,
    scope: Option<&HashSet<String>>,
) -> Reconciliation<'a> {
    let latest: Vec<&DispositionEntry> = latest_per_serial(&snapshot.entries)
        .into_iter()
        .filter(|e| scope.map_or(true, |s| s.contains(&e.sn)))
        .collect();

    let base_year = filters
        .window_start
        .or(filters.reference_date)
        .unwrap_or_else(|| snapshot.parsed_at.date_naive())
        .year();

    let mut classified = Vec::new();
    let mut undated = 0u64;
    for &entry in &latest {
        if normalize_key(&entry.status) != "FAIL" || normalize_key(&entry.pic) != "IGS" {
            continue;
        }
        let Some(nv_date) = last_mmdd(&entry.nv_disposition)
            .and_then(|md| resolve_date(md, base_year, filters.window_start))
        else {
            undated += 1;
            continue;
        };
        if !filters.in_window(nv_date) {
            continue;
        }
        let igs_date = last_mmdd(&entry.igs_action)
            .and_then(|md| resolve_date(md, base_year, filters.window_start));
        let state = match igs_date {
            Some(igs) if igs >= nv_date => IgsState::Complete,
            _ => IgsState::Waiting,
        };
        classified.push(Classified {
            entry,
            sku: sku_label(entry),
            period: filters.granularity.key_for_date(nv_date),
            state,
        });
    }
    Reconciliation {
        latest,
        classified,
        undated,
    }
}

fn rollup<'a, F>(rows: &[Classified<'a>], key: F) -> Vec<DispositionRow>
where
    F: Fn(&Classified<'a>) -> String,
{
    let mut map: BTreeMap<String, DispositionRow> = BTreeMap::new();
    for c in rows {
        let k = key(c);
        let row = map.entry(k.clone()).or_insert_with(|| DispositionRow {
            key: k,
            ..Default::default()
        });
        row.total += 1;
        match c.state {
            IgsState::Waiting => row.waiting_igs += 1,
            IgsState::Complete => row.complete += 1,
        }
    }
    map.into_values().collect()
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Disposition statistics for a snapshot.
///
/// No snapshot yields zero counts. `scope`, when given, restricts the
/// computation to those serials.
pub fn compute_disposition_stats(
    snapshot: Option<&DispositionParseResult>,
    filters: &DispositionFilters,
    scope: Option<&HashSet<String>>,
) -> Report<DispositionStats> {
    let Some(snapshot) = snapshot else {
        return Report::new(DispositionStats::default());
    };
    let rec = reconcile(snapshot, filters, scope);

    let mut summary = DispositionSummary {
        in_scope_tested: rec.latest.len() as u64,
        unique_trays_bp: rec.latest.len() as u64,
        ..Default::default()
    };
    let mut trays: BTreeMap<String, TraySkuRow> = BTreeMap::new();
    for entry in &rec.latest {
        let sku = sku_label(entry);
        let row = trays.entry(sku.clone()).or_insert_with(|| TraySkuRow {
            sku,
            ..Default::default()
        });
        row.total_trays += 1;
        if is_pass_status(&entry.status) {
            row.all_pass_trays += 1;
            summary.all_pass_trays += 1;
        }
    }
    for c in &rec.classified {
        summary.total += 1;
        match c.state {
            IgsState::Waiting => summary.waiting_igs += 1,
            IgsState::Complete => summary.complete += 1,
        }
    }

    let stats = DispositionStats {
        upload_id: Some(snapshot.upload_id.clone()),
        summary,
        by_sku: rollup(&rec.classified, |c| c.sku.clone()),
        by_period: rollup(&rec.classified, |c| c.period.clone())
            .into_iter()
            .filter(|r| filters.period_in_window(&r.key))
            .collect(),
        tray_by_sku: trays.into_values().collect(),
        by_category: rollup(&rec.classified, |c| c.entry.category.clone()),
    };

    tracing::debug!(
        upload_id = %snapshot.upload_id,
        total = stats.summary.total,
        waiting = stats.summary.waiting_igs,
        complete = stats.summary.complete,
        "Disposition stats computed"
    );

    let mut report = Report::new(stats);
    if rec.undated > 0 {
        report.push_warning(Warning::RowsSkipped {
            count: rec.undated,
            reason: "IGS failure without a dated NV disposition".to_string(),
        });
    }
    report
}

/// Serials behind one disposition metric, sorted by serial.
pub fn compute_disposition_sn_list(
    snapshot: Option<&DispositionParseResult>,
    metric: DispositionMetric,
    filters: &DispositionFilters,
    scope: Option<&HashSet<String>>,
) -> Vec<DispositionSnItem> {
    let Some(snapshot) = snapshot else {
        return Vec::new();
    };
    let rec = reconcile(snapshot, filters, scope);
    let sku = filters.sku_filter();
    let sku_ok = |label: &str| sku.as_deref().map_or(true, |s| normalize_key(label) == s);

    let mut items: Vec<DispositionSnItem> = match metric {
        DispositionMetric::TraysBp | DispositionMetric::AllPassTrays => rec
            .latest
            .iter()
            .filter(|e| sku_ok(&sku_label(e)))
            .filter(|e| metric == DispositionMetric::TraysBp || is_pass_status(&e.status))
            .map(|e| DispositionSnItem::from(*e))
            .collect(),
        DispositionMetric::Total | DispositionMetric::Waiting | DispositionMetric::Complete => rec
            .classified
            .iter()
            .filter(|c| sku_ok(&c.sku))
            .filter(|c| filters.period.as_deref().map_or(true, |p| c.period == p.trim()))
            .filter(|c| match metric {
                DispositionMetric::Waiting => c.state == IgsState::Waiting,
                DispositionMetric::Complete => c.state == IgsState::Complete,
                _ => true,
            })
            .map(|c| DispositionSnItem::from(c.entry))
            .collect(),
    };
    items.sort_by(|a, b| a.sn.cmp(&b.sn));
    items
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use trayflow_core::Timestamp;

    fn at(hour: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 10, hour, 0, 0).unwrap()
    }

    fn entry(sn: &str, nvpn: &str, status: &str, pic: &str, nv: &str, igs: &str) -> DispositionEntry {
        DispositionEntry {
            category: "Hold".to_string(),
            excel_row: 3,
            sn: sn.to_string(),
            nvpn: nvpn.to_string(),
            status: status.to_string(),
            pic: pic.to_string(),
            igs_status: String::new(),
            nv_disposition: nv.to_string(),
            igs_action: igs.to_string(),
            nv_dispo_count: 0,
            igs_action_count: 0,
            parsed_at: at(12),
        }
    }

    fn snapshot(entries: Vec<DispositionEntry>) -> DispositionParseResult {
        DispositionParseResult {
            upload_id: "u1".to_string(),
            parsed_at: at(12),
            categories: entries.iter().map(|e| (e.sn.clone(), e.category.clone())).collect(),
            category_counts: BTreeMap::new(),
            rows_applied: entries.len() as u64,
            error_count: 0,
            sheets: Vec::new(),
            issues: Vec::new(),
            ignored_sheets: Vec::new(),
            entries,
        }
    }

    fn march() -> DispositionFilters {
        DispositionFilters::default().with_window(
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
        )
    }

    #[test]
    fn test_no_snapshot_is_empty_not_error() {
        let report = compute_disposition_stats(None, &march(), None);
        assert!(report.is_clean());
        assert_eq!(report.value, DispositionStats::default());
        assert!(compute_disposition_sn_list(None, DispositionMetric::Total, &march(), None).is_empty());
    }

    #[test]
    fn test_waiting_and_complete() {
        let snap = snapshot(vec![
            entry("1", "P-1", "FAIL", "IGS", "3/02 reseat", ""),
            entry("2", "P-1", "FAIL", "IGS", "3/02 reseat 3/05 swap", "3/04 done"),
            entry("3", "P-2", "FAIL", "IGS", "3/05 swap", "3/05 done"),
            entry("4", "P-2", "FAIL", "NV", "3/05 swap", ""),
            entry("5", "", "ALL PASS", "IGS", "", ""),
        ]);
        let report = compute_disposition_stats(Some(&snap), &march(), None);
        let stats = report.value;
        assert_eq!(stats.summary.total, 3);
        assert_eq!(stats.summary.waiting_igs, 2);
        assert_eq!(stats.summary.complete, 1);
        assert_eq!(stats.summary.unique_trays_bp, 5);
        assert_eq!(stats.summary.all_pass_trays, 1);
        assert_eq!(stats.by_sku.len(), 2);
        assert_eq!(stats.by_sku[0].key, "P-1");
        assert_eq!(stats.by_sku[0].waiting_igs, 2);
        assert_eq!(
            stats.tray_by_sku.iter().map(|r| r.sku.as_str()).collect::<Vec<_>>(),
            vec!["P-1", "P-2", UNKNOWN_PART]
        );
        assert_eq!(stats.by_category[0].total, 3);
    }

    #[test]
    fn test_latest_entry_per_serial_wins() {
        let mut older = entry("1", "P-1", "FAIL", "IGS", "3/02", "");
        older.parsed_at = at(8);
        let newer = entry("1", "P-1", "FAIL", "IGS", "3/02", "3/03 fixed");
        let snap = snapshot(vec![newer, older]);
        let stats = compute_disposition_stats(Some(&snap), &march(), None).value;
        assert_eq!(stats.summary.complete, 1);
        assert_eq!(stats.summary.unique_trays_bp, 1);
    }

    #[test]
    fn test_window_and_year_roll() {
        let filters = DispositionFilters::default().with_window(
            NaiveDate::from_ymd_opt(2025, 12, 15).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
        );
        let snap = snapshot(vec![
            // 1/10 is more than 60 days before 12/15 and rolls into 2026.
            entry("1", "P-1", "FAIL", "IGS", "1/10", ""),
            entry("2", "P-1", "FAIL", "IGS", "12/20", "1/02"),
            entry("3", "P-1", "FAIL", "IGS", "11/01", ""),
        ]);
        let stats = compute_disposition_stats(Some(&snap), &filters, None).value;
        assert_eq!(stats.summary.total, 2);
        assert_eq!(stats.summary.complete, 1);
        assert_eq!(
            stats.by_period.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(),
            vec!["2025-12-20", "2026-01-10"]
        );
    }

    #[test]
    fn test_undated_entries_warn() {
        let snap = snapshot(vec![entry("1", "P-1", "FAIL", "IGS", "pending", "")]);
        let report = compute_disposition_stats(Some(&snap), &march(), None);
        assert_eq!(report.value.summary.total, 0);
        assert!(matches!(report.warnings[0], Warning::RowsSkipped { count: 1, .. }));
    }

    #[test]
    fn test_scope_restricts_serials() {
        let snap = snapshot(vec![
            entry("1", "P-1", "FAIL", "IGS", "3/02", ""),
            entry("2", "P-1", "FAIL", "IGS", "3/02", ""),
        ]);
        let scope: HashSet<String> = ["2".to_string()].into_iter().collect();
        let stats = compute_disposition_stats(Some(&snap), &march(), Some(&scope)).value;
        assert_eq!(stats.summary.total, 1);
        assert_eq!(stats.summary.in_scope_tested, 1);
    }

    #[test]
    fn test_sn_list_matches_counts() {
        let snap = snapshot(vec![
            entry("3", "P-2", "FAIL", "IGS", "3/05 swap", "3/05 done"),
            entry("1", "P-1", "FAIL", "IGS", "3/02 reseat 3/04 retest", ""),
            entry("2", "P-1", "FAIL", "IGS", "3/02", "3/01"),
            entry("5", "", "PASS", "IGS", "", ""),
        ]);
        let waiting = compute_disposition_sn_list(Some(&snap), DispositionMetric::Waiting, &march(), None);
        assert_eq!(waiting.iter().map(|i| i.sn.as_str()).collect::<Vec<_>>(), vec!["1", "2"]);
        assert_eq!(waiting[0].last_nv_dispo, "3/04 retest");

        let p1 = march().with_sku("p-1").with_period("2026-03-04");
        let total = compute_disposition_sn_list(Some(&snap), DispositionMetric::Total, &p1, None);
        assert_eq!(total.len(), 1);

        let all = march().with_sku(ALL_SKUS);
        let trays = compute_disposition_sn_list(Some(&snap), DispositionMetric::TraysBp, &all, None);
        assert_eq!(trays.len(), 4);
        let unknown = march().with_sku("Unknown");
        let pass = compute_disposition_sn_list(Some(&snap), DispositionMetric::AllPassTrays, &unknown, None);
        assert_eq!(pass.len(), 1);
        assert_eq!(pass[0].sn, "5");
    }

    #[test]
    fn test_request_key_distinguishes_filters() {
        let a = march();
        let b = march().with_sku("P-1");
        let c = march().with_scope(DispositionScope::LastQuery);
        assert_ne!(a.request_key(), b.request_key());
        assert_ne!(a.request_key(), c.request_key());
        assert_eq!(a.request_key(), march().with_sku(ALL_SKUS).request_key());
    }
}
