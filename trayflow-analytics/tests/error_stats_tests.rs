//! Integration tests for error statistics and their drill-downs
//!
//! Tests verify:
//! - Top-K ranking with first-seen tie-break, independent of input order
//! - Nearest-rank TTC percentiles are reproducible under permutation
//! - Drill-down lists agree with the error-stats cells they open

use proptest::prelude::*;
use trayflow_analytics::{
    compute_error_stats, error_sn_list, ErrorDrill, ErrorDrillRequest, ErrorStatsContext,
    ErrorStatsRequest, ErrorStatsResult, TtcState,
};
use trayflow_core::{AnalyticsConfig, ErrorCode, Outcome, TestRow};
use trayflow_test_utils::assertions::assert_error_code;
use trayflow_test_utils::fixtures::{scenario_rows, TS2_A};
use trayflow_test_utils::generators::arb_batch;
use trayflow_test_utils::t;

// ============================================================================
// HELPERS
// ============================================================================

fn stats(rows: &[TestRow], top_k: usize) -> ErrorStatsResult {
    let request = ErrorStatsRequest {
        top_k: Some(top_k),
        ..Default::default()
    };
    let ctx = ErrorStatsContext::from_config(&AnalyticsConfig::default(), &request).unwrap();
    compute_error_stats(rows, &ctx).unwrap().into_value()
}

fn fail(sn: &str, code: &str, minute: i64) -> TestRow {
    TestRow::new(sn, TS2_A, "FCT", Outcome::Fail, t(minute)).with_error_code(code)
}

/// Counts {A:5, B:5, C:3, D:1}; A is seen before B.
fn top_k_rows() -> Vec<TestRow> {
    let mut rows = Vec::new();
    let mut minute = 0;
    let mut push = |code: &str, n: usize| {
        for i in 0..n {
            rows.push(fail(&format!("18300000{code}{i:04}"), code, minute));
            minute += 1;
        }
    };
    push("A", 1);
    push("B", 5);
    push("A", 4);
    push("C", 3);
    push("D", 1);
    rows
}

// ============================================================================
// TOP-K
// ============================================================================

#[test]
fn test_top_k_tie_break_is_first_seen() {
    let forward = top_k_rows();
    let mut reversed = forward.clone();
    reversed.reverse();

    for rows in [forward, reversed] {
        let result = stats(&rows, 3);
        let codes: Vec<&str> = result.top_errors.iter().map(|e| e.error_code.as_str()).collect();
        assert_eq!(codes, vec!["A", "B", "C"]);
        assert_eq!(result.top_errors[0].fail_events, 5);
        assert_eq!(result.top_errors[1].fail_events, 5);
        assert_eq!(result.total_fail_events, 14);
    }
}

#[test]
fn test_top_error_drill_matches_count() {
    let result = stats(&top_k_rows(), 3);
    for row in &result.top_errors {
        let drill = ErrorDrillRequest::new(ErrorDrill::TopError {
            error_code: row.error_code.clone(),
        });
        let items = error_sn_list(Some(&result), &drill).unwrap();
        assert_eq!(items.len() as u64, row.fail_events);
        let unique = error_sn_list(Some(&result), &drill.clone().unique()).unwrap();
        assert_eq!(unique.len() as u64, row.unique_serials);
    }
}

// ============================================================================
// TTC
// ============================================================================

#[test]
fn test_scenario_ttc() {
    // FCT fail at t10 clears at t40; FLA fail at t3 clears at t15; FCT fail at t20 stays open.
    let result = stats(&scenario_rows(), 5);
    assert_eq!(result.total_fail_events, 3);
    assert_eq!(result.ttc_overall.resolved_events, 2);
    assert_eq!(result.ttc_overall.open_events, 1);
    assert_eq!(result.ttc_overall.stats.max, Some(30.0));

    let open = error_sn_list(
        Some(&result),
        &ErrorDrillRequest::new(ErrorDrill::TtcByError {
            error_code: "E100".to_string(),
            state: TtcState::Open,
        }),
    )
    .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].serial_number, "1830000000002");
}

#[test]
fn test_error_drill_without_run() {
    let drill = ErrorDrillRequest::new(ErrorDrill::TopError {
        error_code: "E100".to_string(),
    });
    assert_error_code(&error_sn_list(None, &drill), ErrorCode::NoActiveQuery);
}

proptest! {
    #[test]
    fn prop_ttc_percentile_is_permutation_invariant(
        (rows, shuffled) in arb_batch(40).prop_flat_map(|rows| (Just(rows.clone()), Just(rows).prop_shuffle()))
    ) {
        let a = stats(&rows, 5);
        let b = stats(&shuffled, 5);
        prop_assert_eq!(&a.ttc_overall.stats, &b.ttc_overall.stats);
        prop_assert_eq!(&a.ttc_by_station, &b.ttc_by_station);
        prop_assert_eq!(&a.ttc_by_period, &b.ttc_by_period);
        prop_assert_eq!(&a.top_errors, &b.top_errors);
    }
}
