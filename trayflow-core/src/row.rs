//! Test-station rows as handed over by the upstream fetcher.

use crate::{normalize_key, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Label used for rows whose part number is empty.
pub const UNKNOWN_PART: &str = "Unknown";

// ============================================================================
// OUTCOME
// ============================================================================

/// Outcome of one test run at one station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Outcome {
    Pass,
    Fail,
}

impl Outcome {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Outcome::Pass => "PASS",
            Outcome::Fail => "FAIL",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, OutcomeParseError> {
        match s.trim().to_lowercase().as_str() {
            "pass" | "passed" => Ok(Outcome::Pass),
            "fail" | "failed" | "failure" => Ok(Outcome::Fail),
            _ => Err(OutcomeParseError(s.to_string())),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Pass)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for Outcome {
    type Err = OutcomeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid outcome string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeParseError(pub String);

impl fmt::Display for OutcomeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid test outcome: {}", self.0)
    }
}

impl std::error::Error for OutcomeParseError {}

// ============================================================================
// TEST ROW
// ============================================================================

/// One observation of a serial number at one station.
///
/// Several rows may share a serial number. Rows are never mutated after
/// ingestion; comparisons go through the `*_key` accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRow {
    pub serial_number: String,
    pub part_number: String,
    pub station: String,
    pub outcome: Outcome,
    pub error_code: Option<String>,
    pub failure_msg: Option<String>,
    pub test_time: Timestamp,
    pub work_order: Option<String>,
    pub tray_id: Option<String>,
    pub station_instance: Option<String>,
}

impl TestRow {
    pub fn new(
        serial_number: impl Into<String>,
        part_number: impl Into<String>,
        station: impl Into<String>,
        outcome: Outcome,
        test_time: Timestamp,
    ) -> Self {
        Self {
            serial_number: serial_number.into(),
            part_number: part_number.into(),
            station: station.into(),
            outcome,
            error_code: None,
            failure_msg: None,
            test_time,
            work_order: None,
            tray_id: None,
            station_instance: None,
        }
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_failure_msg(mut self, msg: impl Into<String>) -> Self {
        self.failure_msg = Some(msg.into());
        self
    }

    pub fn with_tray_id(mut self, tray: impl Into<String>) -> Self {
        self.tray_id = Some(tray.into());
        self
    }

    pub fn with_station_instance(mut self, instance: impl Into<String>) -> Self {
        self.station_instance = Some(instance.into());
        self
    }

    pub fn with_work_order(mut self, wo: impl Into<String>) -> Self {
        self.work_order = Some(wo.into());
        self
    }

    /// Trimmed serial number.
    pub fn serial_key(&self) -> &str {
        self.serial_number.trim()
    }

    /// Normalized part number; empty if the upstream row had none.
    pub fn part_key(&self) -> String {
        normalize_key(&self.part_number)
    }

    /// Part number as shown in SKU rollups.
    pub fn sku_label(&self) -> String {
        let key = self.part_key();
        if key.is_empty() {
            UNKNOWN_PART.to_string()
        } else {
            key
        }
    }

    pub fn station_key(&self) -> String {
        normalize_key(&self.station)
    }

    /// Non-empty tray id, trimmed.
    pub fn tray_key(&self) -> Option<&str> {
        self.tray_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// A row plus its bonepile membership at annotation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotatedRow {
    pub row: TestRow,
    pub is_bonepile: bool,
}

impl AnnotatedRow {
    pub fn new(row: TestRow, is_bonepile: bool) -> Self {
        Self { row, is_bonepile }
    }

    /// Wrap rows with no bonepile information.
    pub fn fresh_batch(rows: impl IntoIterator<Item = TestRow>) -> Vec<AnnotatedRow> {
        rows.into_iter().map(|r| AnnotatedRow::new(r, false)).collect()
    }
}
