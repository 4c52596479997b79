//! Error types for Trayflow operations

use crate::job::JobStateError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable taxonomy code attached to every failure and warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// A part number has no configured pass station.
    ConfigurationGap,
    /// A single input row failed validation and was skipped.
    ValidationError,
    /// A drill-down was requested before any query ran.
    NoActiveQuery,
    /// The disposition workbook could not be read at all.
    ParseFailure,
    /// A query was handed an empty batch.
    EmptyBatch,
    /// Configuration was rejected while loading or validating.
    InvalidConfig,
    /// An illegal job state transition was attempted.
    JobState,
    /// A cache was read after invalidation. Never surfaced; reads recompute.
    CacheStale,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigurationGap => "configuration_gap",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::NoActiveQuery => "no_active_query",
            ErrorCode::ParseFailure => "parse_failure",
            ErrorCode::EmptyBatch => "empty_batch",
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::JobState => "job_state",
            ErrorCode::CacheStale => "cache_stale",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Part number {part_number} has pass rules at both {first} and {second}")]
    DuplicatePassStation {
        part_number: String,
        first: String,
        second: String,
    },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },
}

/// Which retained result a query needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryKind {
    Aggregation,
    ErrorStats,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKind::Aggregation => write!(f, "aggregation"),
            QueryKind::ErrorStats => write!(f, "error-stats"),
        }
    }
}

/// Query-time errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("No active {kind} result; apply a filter first")]
    NoActiveQuery { kind: QueryKind },

    #[error("Empty batch passed to {operation}")]
    EmptyBatch { operation: String },

    #[error("Invalid filter {field}: {reason}")]
    InvalidFilter { field: String, reason: String },
}

/// Disposition workbook failures that fail the whole parse job.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("Workbook unreadable: {reason}")]
    Unreadable { reason: String },

    #[error("Workbook contains no sheets")]
    NoSheets,

    #[error("Workbook has no disposition sheets; ignored: {ignored:?}")]
    NoDispositionSheets { ignored: Vec<String> },
}

/// Master error type for all Trayflow errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrayflowError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Parse failure: {0}")]
    Parse(#[from] ParseFailure),

    #[error("Job state error: {0}")]
    Job(#[from] JobStateError),
}

impl TrayflowError {
    /// Taxonomy code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            TrayflowError::Config(_) => ErrorCode::InvalidConfig,
            TrayflowError::Query(QueryError::NoActiveQuery { .. }) => ErrorCode::NoActiveQuery,
            TrayflowError::Query(QueryError::EmptyBatch { .. }) => ErrorCode::EmptyBatch,
            TrayflowError::Query(QueryError::InvalidFilter { .. }) => ErrorCode::ValidationError,
            TrayflowError::Parse(_) => ErrorCode::ParseFailure,
            TrayflowError::Job(_) => ErrorCode::JobState,
        }
    }

    pub fn no_active_query(kind: QueryKind) -> Self {
        TrayflowError::Query(QueryError::NoActiveQuery { kind })
    }

    pub fn empty_batch(operation: impl Into<String>) -> Self {
        TrayflowError::Query(QueryError::EmptyBatch {
            operation: operation.into(),
        })
    }
}

/// Result type alias for Trayflow operations.
pub type TrayflowResult<T> = Result<T, TrayflowError>;

// =============================================================================
// TESTS
// =============================================================================
