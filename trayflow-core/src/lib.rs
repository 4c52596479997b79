//! Trayflow Core - Data Types
//!
//! Rows, stations, reporting periods, configuration and the error taxonomy
//! shared by every Trayflow crate. This crate carries no aggregation logic.

pub mod config;
pub mod error;
pub mod job;
pub mod period;
pub mod report;
pub mod row;
pub mod station;

pub use config::*;
pub use error::*;
pub use job::*;
pub use period::*;
pub use report::*;
pub use row::*;
pub use station::*;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 content hash used as upload identity and sheet fingerprint.
pub type ContentHash = [u8; 32];

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Lowercase hex rendering of a content hash.
pub fn content_hash_hex(hash: &ContentHash) -> String {
    hex::encode(hash)
}

/// Trim and upper-case an identifier for comparison.
///
/// Part numbers, station names, sheet names and workbook status cells are all
/// compared through this function. Rows themselves are never rewritten.
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_uppercase()
}

// ============================================================================
// TESTS
// ============================================================================
