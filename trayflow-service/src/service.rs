//! Analytics service.
//!
//! Owns every piece of shared state: the last aggregation and error-stats
//! results, the disposition snapshot, the bonepile cross-reference, the
//! disposition cache and parse job records. Queries are synchronous; a
//! workbook parse runs on a Tokio blocking worker while queries keep reading
//! the previous snapshot.

use crate::slot::SnapshotSlot;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use trayflow_analytics::{
    aggregate, compute_error_stats, error_sn_list, sn_list, AggregationContext,
    AggregationResult, DrillFilters, ErrorDrillRequest, ErrorStatsContext, ErrorStatsRequest,
    ErrorStatsResult, FailEventItem, PassRuleTable, SnListItem, SnMetric,
};
use trayflow_bonepile::{
    add_bonepile_flag, compute_disposition_sn_list, compute_disposition_stats, BonepileCrossRef,
    CacheKey, CacheStats, DispositionCache, DispositionFilters, DispositionMetric,
    DispositionScope, DispositionSnItem, DispositionStats, DispositionStore, JobHandle,
    JobRegistry, JobSnapshot, ParseJob, Pending, SheetParser, Workbook,
};
use trayflow_core::{
    AnalyticsConfig, Granularity, JobId, ParseFailure, QueryKind, Report, TestRow,
    TrayflowError, TrayflowResult,
};

/// Cache key component used before any successful parse.
const NO_UPLOAD: &str = "none";

/// Last aggregation plus the generation that produced it.
#[derive(Debug)]
struct LastQuery {
    generation: u64,
    result: Arc<AggregationResult>,
}

/// Workbook input of a parse job.
enum ParseSource {
    Bytes(Vec<u8>),
    Workbook(Workbook),
}

impl ParseSource {
    fn into_workbook(self) -> TrayflowResult<Workbook> {
        match self {
            ParseSource::Bytes(bytes) => Ok(Workbook::from_xlsx_bytes(&bytes)?),
            ParseSource::Workbook(workbook) => Ok(workbook),
        }
    }
}

struct ServiceState {
    config: AnalyticsConfig,
    rules: PassRuleTable,
    parser: SheetParser,
    last_query: SnapshotSlot<LastQuery>,
    last_error_stats: SnapshotSlot<ErrorStatsResult>,
    query_generation: AtomicU64,
    store: Arc<DispositionStore>,
    bonepile: BonepileCrossRef<Arc<DispositionStore>>,
    disposition_cache: DispositionCache,
    jobs: JobRegistry,
    workers: DashMap<JobId, JoinHandle<()>>,
}

/// Cheaply cloneable handle to the shared service state.
#[derive(Clone)]
pub struct AnalyticsService {
    state: Arc<ServiceState>,
    runtime: Option<Handle>,
}

impl std::fmt::Debug for AnalyticsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsService")
            .field("has_runtime", &self.runtime.is_some())
            .field("jobs", &self.state.jobs.len())
            .field("bonepile_generation", &self.state.bonepile.generation())
            .finish()
    }
}

impl AnalyticsService {
    /// Build a service from a configuration, validating it first.
    ///
    /// Parse jobs run on the Tokio runtime current at construction; without
    /// one they run inline inside `submit_*`.
    pub fn new(config: AnalyticsConfig) -> TrayflowResult<Self> {
        config.validate()?;
        let rules = PassRuleTable::from_config(&config)?;
        let parser = SheetParser::new(&config.bonepile)?;
        let store = Arc::new(DispositionStore::new());
        let bonepile = BonepileCrossRef::new(Arc::clone(&store), config.bonepile.accumulate);

        tracing::info!(
            stations = config.stations_order.len(),
            pass_rules = rules.len(),
            timezone = %config.timezone,
            accumulate = config.bonepile.accumulate,
            "Analytics service created"
        );

        Ok(Self {
            state: Arc::new(ServiceState {
                config,
                rules,
                parser,
                last_query: SnapshotSlot::new(),
                last_error_stats: SnapshotSlot::new(),
                query_generation: AtomicU64::new(0),
                store,
                bonepile,
                disposition_cache: DispositionCache::new(),
                jobs: JobRegistry::new(),
                workers: DashMap::new(),
            }),
            runtime: Handle::try_current().ok(),
        })
    }

    /// Load configuration (file, then `TRAYFLOW_*` overrides) and build.
    pub fn from_path(path: Option<&std::path::Path>) -> TrayflowResult<Self> {
        Self::new(AnalyticsConfig::load(path)?)
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.state.config
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Annotate `rows` with bonepile membership, aggregate them and keep the
    /// result as the active query for drill-downs.
    pub fn run_query(
        &self,
        rows: &[TestRow],
        granularity: Option<Granularity>,
    ) -> TrayflowResult<Report<Arc<AggregationResult>>> {
        let state = &self.state;
        let ctx = AggregationContext::from_config(&state.config, granularity)?;
        let set = state.bonepile.current();
        let annotated = add_bonepile_flag(rows, &set);
        let report = aggregate(&annotated, &state.rules, &ctx)?;

        let generation = state.query_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let report = report.map(|result| {
            let result = Arc::new(result);
            state.last_query.set(LastQuery {
                generation,
                result: Arc::clone(&result),
            });
            result
        });
        state.disposition_cache.evict_superseded(generation);

        tracing::info!(
            rows = rows.len(),
            serials = report.value.summary.total,
            passed = report.value.summary.passed,
            bonepile = report.value.summary.bonepile,
            bonepile_generation = set.generation(),
            warnings = report.warnings.len(),
            "Aggregation query completed"
        );
        Ok(report)
    }

    /// Compute error statistics and keep them as the active error-stats query.
    pub fn run_error_stats(
        &self,
        rows: &[TestRow],
        request: &ErrorStatsRequest,
    ) -> TrayflowResult<Report<Arc<ErrorStatsResult>>> {
        let ctx = ErrorStatsContext::from_config(&self.state.config, request)?;
        let report = compute_error_stats(rows, &ctx)?
            .map(|result| self.state.last_error_stats.set(result));

        tracing::info!(
            rows = rows.len(),
            fail_events = report.value.total_fail_events,
            open_events = report.value.ttc_overall.open_events,
            warnings = report.warnings.len(),
            "Error stats query completed"
        );
        Ok(report)
    }

    /// Serials behind one cell of the active aggregation.
    pub fn get_sn_list(
        &self,
        metric: &SnMetric,
        filters: &DrillFilters,
    ) -> TrayflowResult<Vec<SnListItem>> {
        let last = self.state.last_query.get();
        sn_list(last.as_ref().map(|q| q.result.as_ref()), metric, filters)
    }

    /// Fail events behind one cell of the active error-stats query.
    pub fn get_error_stats_sn_list(
        &self,
        drill: &ErrorDrillRequest,
    ) -> TrayflowResult<Vec<FailEventItem>> {
        let last = self.state.last_error_stats.get();
        error_sn_list(last.as_deref(), drill)
    }

    pub fn last_query(&self) -> Option<Arc<AggregationResult>> {
        self.state.last_query.get().map(|q| Arc::clone(&q.result))
    }

    pub fn last_error_stats(&self) -> Option<Arc<ErrorStatsResult>> {
        self.state.last_error_stats.get()
    }

    /// Forget the active aggregation and error-stats results.
    pub fn clear_last_query(&self) {
        let had_query = self.state.last_query.take().is_some();
        let had_error_stats = self.state.last_error_stats.take().is_some();
        let generation = self.state.query_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.disposition_cache.evict_superseded(generation);
        tracing::info!(had_query, had_error_stats, "Last query cleared");
    }

    // ========================================================================
    // PARSE JOBS
    // ========================================================================

    /// Parse an xlsx byte stream on a blocking worker.
    pub fn submit_disposition_parse(&self, bytes: Vec<u8>) -> JobHandle {
        self.submit(ParseSource::Bytes(bytes))
    }

    /// Parse an already-loaded workbook on a blocking worker.
    pub fn submit_disposition_workbook(&self, workbook: Workbook) -> JobHandle {
        self.submit(ParseSource::Workbook(workbook))
    }

    fn submit(&self, source: ParseSource) -> JobHandle {
        let job = ParseJob::new(Utc::now());
        let handle = job.handle();
        self.state.record(&job);

        match &self.runtime {
            Some(runtime) => self.spawn_worker(runtime, job, source),
            None => self.state.run_parse(job, source),
        }
        handle
    }

    /// Run the parse on a blocking thread under a supervisor task.
    ///
    /// The supervisor fails the job if the worker dies and removes its own
    /// `workers` entry, so callers may poll `job_status` without ever
    /// calling `wait`.
    fn spawn_worker(&self, runtime: &Handle, job: ParseJob<Pending>, source: ParseSource) {
        let handle = job.handle();
        let worker_state = Arc::clone(&self.state);
        let worker = runtime.spawn_blocking(move || worker_state.run_parse(job, source));

        // The entry must exist before the supervisor may remove it.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let state = Arc::clone(&self.state);
        let supervisor = runtime.spawn(async move {
            let _ = registered_rx.await;
            if let Err(e) = worker.await {
                tracing::error!(job_id = %handle, error = %e, "Parse worker aborted");
                state.abandon(&handle, e.to_string());
            }
            state.workers.remove(&handle.id());
        });
        self.state.workers.insert(handle.id(), supervisor);
        let _ = registered_tx.send(());
    }

    pub fn job_status(&self, handle: &JobHandle) -> Option<JobSnapshot> {
        self.state.jobs.get(handle)
    }

    /// Wait for a job's worker to finish and return its final record.
    ///
    /// Optional: the job reaches a terminal state whether or not anyone
    /// waits. A worker that panicked leaves its job `Failed`.
    pub async fn wait(&self, handle: &JobHandle) -> Option<JobSnapshot> {
        let supervisor = self.state.workers.remove(&handle.id()).map(|(_, s)| s);
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                tracing::error!(job_id = %handle, error = %e, "Parse supervisor aborted");
                self.state.abandon(handle, e.to_string());
            }
        }
        self.job_status(handle)
    }

    /// Parse workers still in flight.
    pub fn active_workers(&self) -> usize {
        self.state.workers.len()
    }

    // ========================================================================
    // BONEPILE & DISPOSITION
    // ========================================================================

    pub fn is_in_bonepile(&self, serial: &str) -> bool {
        self.state.bonepile.is_in_bonepile(serial)
    }

    pub fn bonepile_generation(&self) -> u64 {
        self.state.bonepile.generation()
    }

    /// Drop the bonepile set; the next lookup rebuilds it.
    pub fn invalidate_bonepile_cache(&self) {
        self.state.bonepile.invalidate();
    }

    pub fn invalidate_disposition_cache(&self) {
        self.state.disposition_cache.invalidate();
    }

    pub fn disposition_cache_stats(&self) -> CacheStats {
        self.state.disposition_cache.stats()
    }

    /// Waiting/complete statistics of the current disposition snapshot.
    ///
    /// Zero stats before the first successful parse. `LastQuery` scope needs
    /// an active aggregation.
    pub fn compute_disposition_stats(
        &self,
        filters: &DispositionFilters,
    ) -> TrayflowResult<Arc<Report<DispositionStats>>> {
        let scope = self.scope(filters.scope)?;
        let Some(snapshot) = self.state.store.current() else {
            return Ok(Arc::new(compute_disposition_stats(None, filters, None)));
        };

        let key = self.cache_key(&snapshot.upload_id, filters.request_key(), scope.as_ref());
        let read = self.state.disposition_cache.stats_or_compute(key, || {
            let serials = scope.as_ref().map(|q| serial_set(&q.result));
            compute_disposition_stats(Some(snapshot.as_ref()), filters, serials.as_ref())
        });
        Ok(read.into_value())
    }

    /// Entries behind one disposition metric, sorted by serial number.
    pub fn compute_disposition_sn_list(
        &self,
        metric: DispositionMetric,
        filters: &DispositionFilters,
    ) -> TrayflowResult<Arc<Vec<DispositionSnItem>>> {
        let scope = self.scope(filters.scope)?;
        let Some(snapshot) = self.state.store.current() else {
            return Ok(Arc::new(Vec::new()));
        };

        let request = format!("{}|{}", metric.as_str(), filters.request_key());
        let key = self.cache_key(&snapshot.upload_id, request, scope.as_ref());
        let read = self.state.disposition_cache.sn_list_or_compute(key, || {
            let serials = scope.as_ref().map(|q| serial_set(&q.result));
            compute_disposition_sn_list(Some(snapshot.as_ref()), metric, filters, serials.as_ref())
        });
        Ok(read.into_value())
    }

    fn scope(&self, scope: DispositionScope) -> TrayflowResult<Option<Arc<LastQuery>>> {
        match scope {
            DispositionScope::Registry => Ok(None),
            DispositionScope::LastQuery => self
                .state
                .last_query
                .get()
                .map(Some)
                .ok_or_else(|| TrayflowError::no_active_query(QueryKind::Aggregation)),
        }
    }

    fn cache_key(&self, upload_id: &str, request: String, scope: Option<&Arc<LastQuery>>) -> CacheKey {
        let upload_id = if upload_id.is_empty() { NO_UPLOAD } else { upload_id };
        match scope {
            Some(q) => CacheKey::scoped(upload_id, request, q.generation),
            None => CacheKey::new(upload_id, request),
        }
    }
}

fn serial_set(result: &AggregationResult) -> HashSet<String> {
    result
        .serials
        .iter()
        .map(|f| f.serial_number.clone())
        .collect()
}

impl ServiceState {
    fn record<S: trayflow_bonepile::JobState>(&self, job: &ParseJob<S>) {
        if let Err(e) = self.jobs.record(job) {
            tracing::error!(job_id = %job.job_id(), error = %e, "Rejected job transition");
        }
    }

    /// Body of a parse worker.
    fn run_parse(&self, job: ParseJob<Pending>, source: ParseSource) {
        let running = job.start(Utc::now());
        self.record(&running);

        let previous = self.store.current();
        let parsed = source.into_workbook().and_then(|workbook| {
            Ok(self
                .parser
                .parse(&workbook, previous.as_deref(), Utc::now())?)
        });

        match parsed {
            Ok(snapshot) => {
                let succeeded = running.succeed(Utc::now(), &snapshot);
                // Install before publishing Succeeded so pollers see the new data.
                self.store.replace(snapshot);
                self.bonepile.invalidate();
                self.disposition_cache.invalidate();
                self.record(&succeeded);
            }
            Err(e) => {
                tracing::warn!(job_id = %running.job_id(), error = %e, code = %e.code(), "Disposition parse failed");
                let failed = running.fail(Utc::now(), e);
                self.record(&failed);
            }
        }
    }

    /// Mark a job whose worker died as failed.
    fn abandon(&self, handle: &JobHandle, reason: String) {
        let Some(snapshot) = self.jobs.get(handle) else {
            return;
        };
        if snapshot.is_terminal() {
            return;
        }
        let error = TrayflowError::from(ParseFailure::Unreadable {
            reason: format!("parse worker aborted: {reason}"),
        });
        let failed = match snapshot.into_running() {
            Ok(running) => running.fail(Utc::now(), error),
            Err(e) => {
                tracing::error!(job_id = %handle, error = %e, "Cannot fail abandoned job");
                return;
            }
        };
        self.record(&failed);
    }
}

// ============================================================================
// TESTS
// ============================================================================
