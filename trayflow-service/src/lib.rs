//! Trayflow Service - Stateful facade over the analytics and bonepile crates
//!
//! Holds the last query results, the disposition snapshot, the bonepile
//! cross-reference and the disposition cache, and runs workbook parses on
//! blocking workers.

pub mod service;
pub mod slot;
pub mod telemetry;

pub use service::AnalyticsService;
pub use slot::SnapshotSlot;
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, TelemetryError};
