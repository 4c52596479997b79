//! Trayflow Test Utilities
//!
//! Shared test infrastructure for the Trayflow workspace:
//! - Proptest generators for rows and batches
//! - Fixtures for the canonical end-to-end scenario and disposition workbooks
//! - Custom assertions for Trayflow results

pub use trayflow_core::{
    AnalyticsConfig, AnnotatedRow, ErrorCode, Outcome, Report, TestRow, Timestamp,
    TrayflowError, TrayflowResult, Warning,
};

use chrono::{Duration, TimeZone, Utc};

/// Fixed origin for generated timestamps (2026-03-02 08:00 Pacific).
pub fn base_time() -> Timestamp {
    Utc.with_ymd_and_hms(2026, 3, 2, 16, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// `base_time()` plus `minutes`.
pub fn t(minutes: i64) -> Timestamp {
    base_time() + Duration::minutes(minutes)
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for test rows and batches.

    use super::*;
    use proptest::prelude::*;

    /// Part numbers: two configured by default, one unconfigured, one blank.
    pub const PARTS: [&str; 4] = [
        "675-24109-0010-TS2",
        "675-24109-0020-TS2",
        "699-UNMAPPED-0001",
        "",
    ];

    pub fn arb_outcome() -> impl Strategy<Value = Outcome> {
        prop_oneof![Just(Outcome::Pass), Just(Outcome::Fail)]
    }

    pub fn arb_station() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("FLA".to_string()),
            Just("FLB".to_string()),
            Just("FCT".to_string()),
            Just("NVL".to_string()),
            Just("R_FCT".to_string()),
        ]
    }

    pub fn arb_part_number() -> impl Strategy<Value = String> {
        (0..PARTS.len()).prop_map(|i| PARTS[i].to_string())
    }

    /// Serial numbers from a small pool so rows collide on serials.
    pub fn arb_serial() -> impl Strategy<Value = String> {
        (0u32..12).prop_map(|i| format!("18300000000{i:02}"))
    }

    pub fn arb_error_code() -> impl Strategy<Value = Option<String>> {
        prop_oneof![
            Just(None),
            Just(Some("E100".to_string())),
            Just(Some("E200".to_string())),
            Just(Some("E300".to_string())),
        ]
    }

    /// A row at `minute` past `base_time()`.
    pub fn arb_test_row(minute: i64) -> impl Strategy<Value = TestRow> {
        (
            arb_serial(),
            arb_part_number(),
            arb_station(),
            arb_outcome(),
            arb_error_code(),
            prop::option::of(0u32..4),
        )
            .prop_map(move |(sn, part, station, outcome, code, tray)| {
                let mut row = TestRow::new(sn, part, station, outcome, t(minute));
                if outcome == Outcome::Fail {
                    row.error_code = code;
                }
                row.tray_id = tray.map(|n| format!("TRAY-{n}"));
                row
            })
    }

    /// A non-empty batch with distinct, increasing timestamps.
    ///
    /// The serial's part number is fixed by its first row so a serial never
    /// carries two part numbers.
    pub fn arb_batch(max_len: usize) -> impl Strategy<Value = Vec<TestRow>> {
        (1..=max_len.max(1))
            .prop_flat_map(|len| {
                (0..len)
                    .map(|i| arb_test_row(i as i64 * 7))
                    .collect::<Vec<_>>()
            })
            .prop_map(|mut rows| {
                let mut parts = std::collections::HashMap::new();
                for row in &mut rows {
                    let part = parts
                        .entry(row.serial_number.clone())
                        .or_insert_with(|| row.part_number.clone());
                    row.part_number = part.clone();
                }
                rows
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;
    use trayflow_bonepile::{Sheet, Workbook};

    pub const TS2_A: &str = "675-24109-0010-TS2";
    pub const TS2_B: &str = "675-24109-0020-TS2";
    pub const TS3: &str = "699-13809-0000-TS3";
    pub const UNMAPPED: &str = "699-UNMAPPED-0001";

    /// Default configuration plus a FLA rule for the TS3 part.
    pub fn scenario_config() -> AnalyticsConfig {
        let mut cfg = AnalyticsConfig::default();
        cfg.pass_rules.insert("FLA".to_string(), vec![TS3.to_string()]);
        cfg
    }

    /// 10 rows, 4 serials, stations FLA and FCT.
    ///
    /// - `1830000000001` (TS2 A): FLA pass, FCT fail, FCT pass → passed
    /// - `1830000000002` (TS2 B): FLA pass, FCT fail → failed
    /// - `1830000000003` (TS3, FLA rule): FLA fail, FLA pass, FCT pass → passed
    /// - `1830000000004` (unconfigured): FLA pass, FCT pass → not passed
    pub fn scenario_rows() -> Vec<TestRow> {
        vec![
            TestRow::new("1830000000001", TS2_A, "FLA", Outcome::Pass, t(0)),
            TestRow::new("1830000000001", TS2_A, "FCT", Outcome::Fail, t(10))
                .with_error_code("E100")
                .with_failure_msg("PCIe link down"),
            TestRow::new("1830000000001", TS2_A, "FCT", Outcome::Pass, t(40)),
            TestRow::new("1830000000002", TS2_B, "FLA", Outcome::Pass, t(5)),
            TestRow::new("1830000000002", TS2_B, "FCT", Outcome::Fail, t(20))
                .with_error_code("E100")
                .with_failure_msg("PCIe link down"),
            TestRow::new("1830000000003", TS3, "FLA", Outcome::Fail, t(3))
                .with_error_code("E200")
                .with_failure_msg("Thermal trip"),
            TestRow::new("1830000000003", TS3, "FLA", Outcome::Pass, t(15)),
            TestRow::new("1830000000003", TS3, "FCT", Outcome::Pass, t(30)),
            TestRow::new("1830000000004", UNMAPPED, "FLA", Outcome::Pass, t(8)),
            TestRow::new("1830000000004", UNMAPPED, "FCT", Outcome::Pass, t(25)),
        ]
    }

    /// Disposition sheet header in the usual column order.
    pub const DISPOSITION_HEADER: [&str; 7] = [
        "SN",
        "NVPN",
        "STATUS",
        "PIC",
        "NV Disposition",
        "IGS Action",
        "IGS Status",
    ];

    /// A disposition sheet with a title row, the header, then `rows`.
    pub fn disposition_sheet(name: &str, rows: &[[&str; 7]]) -> Sheet {
        let mut sheet = Sheet::new(name)
            .with_row(["Bonepile disposition tracker"])
            .with_row(DISPOSITION_HEADER);
        for row in rows {
            sheet = sheet.with_row(*row);
        }
        sheet
    }

    /// One `Hold` sheet listing `serials` as IGS failures, plus a summary sheet.
    pub fn disposition_workbook(serials: &[&str]) -> Workbook {
        let rows: Vec<[&str; 7]> = serials
            .iter()
            .map(|sn| [*sn, TS2_A, "FAIL", "IGS", "3/02 reseat", "", "open"])
            .collect();
        Workbook::new()
            .with_sheet(Sheet::new("Summary").with_row(["total", "3"]))
            .with_sheet(disposition_sheet("Hold", &rows))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for Trayflow results.

    use super::*;

    /// Assert that a TrayflowResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &TrayflowResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a TrayflowResult is Err.
    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &TrayflowResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    /// Assert that a TrayflowResult failed with the given taxonomy code.
    #[track_caller]
    pub fn assert_error_code<T: std::fmt::Debug>(result: &TrayflowResult<T>, code: ErrorCode) {
        match result {
            Err(err) => assert_eq!(err.code(), code, "Wrong error code for {err}"),
            Ok(v) => panic!("Expected {code} error, got Ok: {v:?}"),
        }
    }

    /// Assert that a report carries no warnings.
    #[track_caller]
    pub fn assert_clean<T: std::fmt::Debug>(report: &Report<T>) {
        assert!(report.is_clean(), "Expected no warnings, got: {:?}", report.warnings);
    }

    /// Assert that a report carries a warning with the given code.
    #[track_caller]
    pub fn assert_warned<T>(report: &Report<T>, code: ErrorCode) {
        assert!(
            report.has_code(code),
            "Expected a {code} warning, got: {:?}",
            report.warnings
        );
    }
}
