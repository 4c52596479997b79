//! Trayflow Analytics - Rollups over a batch of test rows
//!
//! Pure, synchronous computations. Every function here takes an immutable
//! batch and returns a fresh result; callers decide where results live.

pub mod aggregation;
pub mod drilldown;
pub mod error_stats;
pub mod pass_rules;
pub mod timeline;
pub mod ttc;

pub use aggregation::*;
pub use drilldown::*;
pub use error_stats::*;
pub use pass_rules::*;
pub use timeline::*;
pub use ttc::*;
