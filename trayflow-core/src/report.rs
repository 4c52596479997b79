//! Result envelope for query-shaped operations.
//!
//! `Ok(Report)` with no warnings is a full success, `Ok(Report)` with warnings
//! is a success-with-warnings, and `Err(TrayflowError)` is an explicit failure.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};

/// Non-fatal condition surfaced next to a computed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Part numbers seen in the batch without a configured pass station.
    UnassignedPartNumbers { part_numbers: Vec<String> },
    /// Rows ignored by a computation, with the reason.
    RowsSkipped { count: u64, reason: String },
    /// Rows rejected by per-row validation.
    RowValidation { count: u64 },
    /// Sheets that could not be mapped and were left out.
    SheetErrors { sheets: Vec<String> },
}

impl Warning {
    pub fn code(&self) -> ErrorCode {
        match self {
            Warning::UnassignedPartNumbers { .. } => ErrorCode::ConfigurationGap,
            Warning::RowsSkipped { .. }
            | Warning::RowValidation { .. }
            | Warning::SheetErrors { .. } => ErrorCode::ValidationError,
        }
    }
}

/// A computed value plus the warnings raised while computing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report<T> {
    pub value: T,
    pub warnings: Vec<Warning>,
}

impl<T> Report<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: Warning) -> Self {
        self.warnings.push(warning);
        self
    }

    pub fn push_warning(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    /// True when no warnings were raised.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn map<U, F>(self, f: F) -> Report<U>
    where
        F: FnOnce(T) -> U,
    {
        Report {
            value: f(self.value),
            warnings: self.warnings,
        }
    }

    pub fn has_code(&self, code: ErrorCode) -> bool {
        self.warnings.iter().any(|w| w.code() == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_and_warned() {
        let clean = Report::new(3u32);
        assert!(clean.is_clean());

        let warned = Report::new(3u32).with_warning(Warning::UnassignedPartNumbers {
            part_numbers: vec!["X-1".to_string()],
        });
        assert!(!warned.is_clean());
        assert!(warned.has_code(ErrorCode::ConfigurationGap));
        assert!(!warned.has_code(ErrorCode::ValidationError));
        assert_eq!(warned.map(|v| v * 2).into_value(), 6);
    }

    #[test]
    fn test_warning_serializes_with_kind_tag() {
        let w = Warning::RowsSkipped {
            count: 2,
            reason: "empty serial number".to_string(),
        };
        let json = serde_json::to_value(&w).unwrap();
        assert_eq!(json["kind"], "rows_skipped");
        assert_eq!(json["count"], 2);
    }
}
