//! Trayflow Bonepile - Hold/Scrap Registry and Disposition Workbooks
//!
//! Parses the bonepile disposition workbook into snapshots, keeps the serial
//! cross-reference used to annotate test rows, and reconciles dispositions
//! into waiting/complete statistics.

pub mod cache;
pub mod cells;
pub mod disposition;
pub mod job;
pub mod parse;
pub mod sn_set;
pub mod store;
pub mod workbook;

pub use cache::{CacheKey, CacheRead, CacheStats, DispositionCache};
pub use disposition::{
    compute_disposition_sn_list, compute_disposition_stats, DispositionFilters, DispositionMetric,
    DispositionRow, DispositionScope, DispositionSnItem, DispositionStats, DispositionSummary,
    TraySkuRow, ALL_SKUS,
};
pub use job::{
    Failed, JobFailure, JobHandle, JobRegistry, JobSnapshot, JobState, ParseJob, ParseJobData,
    Pending, Running, Succeeded,
};
pub use parse::{
    parse_workbook, DispositionEntry, DispositionParseResult, RowIssue, SheetParser, SheetState,
    SheetStatus,
};
pub use sn_set::{add_bonepile_flag, BonepileCrossRef, BonepileSnSet, LoadedSerials, SnSetLoader};
pub use store::DispositionStore;
pub use workbook::{Sheet, Workbook};
