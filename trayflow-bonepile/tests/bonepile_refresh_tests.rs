//! Integration tests for workbook parsing feeding the bonepile set
//!
//! Tests verify:
//! - A row missing its serial is counted, skipped, and never fails the job
//! - Invalidate + re-parse exposes newly added serials with a new generation
//! - Unchanged sheets are reused across parses
//! - The rebuilt set always equals the snapshot's serials (or their union
//!   when accumulating)

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use trayflow_bonepile::{
    add_bonepile_flag, BonepileCrossRef, DispositionStore, JobRegistry, ParseJob, SheetParser,
    SheetState,
};
use trayflow_core::{BonepileConfig, ErrorCode, JobStatus, Outcome, TestRow};
use trayflow_test_utils::fixtures::{disposition_sheet, disposition_workbook, TS2_A};
use trayflow_test_utils::{base_time, t};

// ============================================================================
// HELPERS
// ============================================================================

fn parser() -> SheetParser {
    SheetParser::new(&BonepileConfig::default()).unwrap()
}

fn cross_ref(accumulate: bool) -> (Arc<DispositionStore>, BonepileCrossRef<Arc<DispositionStore>>) {
    let store = Arc::new(DispositionStore::new());
    let xref = BonepileCrossRef::new(Arc::clone(&store), accumulate);
    (store, xref)
}

fn parse_into(store: &DispositionStore, serials: &[&str]) {
    let previous = store.current();
    let snapshot = parser()
        .parse(&disposition_workbook(serials), previous.as_deref(), base_time())
        .unwrap();
    store.replace(snapshot);
}

// ============================================================================
// PARSE JOB
// ============================================================================

#[test]
fn test_missing_serial_is_counted_not_fatal() {
    let rows = [
        ["1830000000001", TS2_A, "FAIL", "IGS", "3/02 reseat", "", "open"],
        ["", TS2_A, "FAIL", "IGS", "3/03 swap", "", "open"],
        ["1830000000003", TS2_A, "FAIL", "IGS", "3/04 reseat", "3/05 done", "closed"],
    ];
    let workbook = trayflow_bonepile::Workbook::new().with_sheet(disposition_sheet("Hold", &rows));

    let registry = JobRegistry::new();
    let job = ParseJob::new(t(0));
    registry.record(&job).unwrap();
    let running = job.start(t(1));
    registry.record(&running).unwrap();

    let snapshot = parser().parse(&workbook, None, t(2)).unwrap();
    let done = running.succeed(t(3), &snapshot);
    registry.record(&done).unwrap();

    let stored = registry.get(&done.handle()).unwrap();
    assert_eq!(stored.status, JobStatus::Succeeded);
    assert_eq!(stored.data.rows_applied, Some(rows.len() as u64 - 1));
    assert_eq!(stored.data.error_count, Some(1));
    assert_eq!(snapshot.issues.len(), 1);
    assert!(snapshot
        .warnings()
        .iter()
        .any(|w| w.code() == ErrorCode::ValidationError));
}

#[test]
fn test_terminal_job_rejects_rewrite() {
    let registry = JobRegistry::new();
    let failed = ParseJob::new(t(0)).fail(t(1), trayflow_core::ParseFailure::NoSheets.into());
    registry.record(&failed).unwrap();

    let mut stale = registry.get(&failed.handle()).unwrap();
    stale.status = JobStatus::Pending;
    let restarted = stale.into_pending().unwrap().start(t(2));
    assert!(registry.record(&restarted).is_err());
    assert_eq!(
        registry.get(&failed.handle()).map(|j| j.status),
        Some(JobStatus::Failed)
    );
}

#[test]
fn test_unchanged_sheet_is_reused() {
    let workbook = disposition_workbook(&["1830000000001", "1830000000002"]);
    let first = parser().parse(&workbook, None, t(0)).unwrap();
    let second = parser().parse(&workbook, Some(&first), t(10)).unwrap();

    assert_eq!(first.upload_id, second.upload_id);
    assert_eq!(
        second.sheet_status("Hold").map(|s| &s.state),
        Some(&SheetState::Unchanged)
    );
    assert_eq!(second.rows_applied, first.rows_applied);
    assert_eq!(second.ignored_sheets, vec!["Summary".to_string()]);
}

// ============================================================================
// CROSS-REFERENCE REFRESH
// ============================================================================

#[test]
fn test_invalidate_then_reparse_exposes_new_serial() {
    let (store, xref) = cross_ref(false);
    parse_into(&store, &["1830000000001"]);

    let before = xref.current();
    assert!(before.contains("1830000000001"));
    assert!(!xref.is_in_bonepile("1830000000009"));

    parse_into(&store, &["1830000000001", "1830000000009"]);
    // Stale until invalidated.
    assert!(!xref.is_in_bonepile("1830000000009"));

    xref.invalidate();
    let after = xref.current();
    assert!(after.contains("1830000000009"));
    assert!(after.generation() > before.generation());
    for _ in 0..3 {
        assert_eq!(xref.current().generation(), after.generation());
    }
    // A reader that took the old set before invalidation still sees it.
    assert!(!before.contains("1830000000009"));
}

#[test]
fn test_flagged_rows_follow_current_set() {
    let (store, xref) = cross_ref(false);
    parse_into(&store, &["1830000000002"]);

    let rows = vec![
        TestRow::new("1830000000001", TS2_A, "FCT", Outcome::Pass, t(0)),
        TestRow::new(" 1830000000002 ", TS2_A, "FCT", Outcome::Fail, t(5)),
    ];
    let flagged = add_bonepile_flag(&rows, &xref.current());
    let flags: Vec<bool> = flagged.iter().map(|r| r.is_bonepile).collect();
    assert_eq!(flags, vec![false, true]);
}

// ============================================================================
// PROPERTIES
// ============================================================================

fn arb_serials() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::btree_set(0u32..40, 0..8)
        .prop_map(|s| s.into_iter().map(|i| format!("18300000000{i:02}")).collect())
}

proptest! {
    #[test]
    fn prop_rebuilt_set_matches_snapshot(first in arb_serials(), second in arb_serials()) {
        for accumulate in [false, true] {
            let (store, xref) = cross_ref(accumulate);
            fn refs(v: &[String]) -> Vec<&str> {
                v.iter().map(String::as_str).collect()
            }

            parse_into(&store, &refs(&first));
            xref.invalidate();
            xref.current();
            parse_into(&store, &refs(&second));
            xref.invalidate();
            let set = xref.current();

            let mut expected: HashSet<&String> = second.iter().collect();
            if accumulate {
                expected.extend(first.iter());
            }
            prop_assert_eq!(set.len(), expected.len());
            for sn in expected {
                prop_assert!(set.contains(sn));
            }
        }
    }
}
