//! Orchestrates ingestion runs: discovery, admission, parallel preparation
//! (read, normalize, validate, stage) and sequential transactional merges.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::errors::{PipelineError, Result};
use crate::fetcher::{discover_files, read_source};
use crate::loader::{
    Admission, AuditRecorder, IdempotencyGuard, WarehouseUpserter, aggregates, fingerprint_file,
};
use crate::models::{NewAuditEntry, RunStatus};
use crate::processor::{BatchValidation, DqValidator, NormalizedRow, SchemaNormalizer, format_timestamp};
use crate::storage::{QuarantineStore, RunLock, SchemaReport, StageWriter, Warehouse, read_stage};

/// Outcome of one run, mirrored in its audit entry.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub file: PathBuf,
    pub fingerprint: String,
    pub status: RunStatus,
    pub rows_read: usize,
    pub rows_accepted: usize,
    pub rows_quarantined: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub audit_id: Option<i64>,
    pub message: Option<String>,
    pub stage_path: Option<PathBuf>,
    pub quarantine_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub files_discovered: usize,
    pub runs: Vec<RunReport>,
    pub aborted: bool,
}

impl IngestSummary {
    pub fn count(&self, status: RunStatus) -> usize {
        self.runs.iter().filter(|r| r.status == status).count()
    }

    /// True when any run failed or the invocation was interrupted.
    pub fn has_failures(&self) -> bool {
        self.aborted
            || self
                .runs
                .iter()
                .any(|r| matches!(r.status, RunStatus::Failed | RunStatus::Aborted))
    }
}

/// Run identity shared by every stage of one file's ingestion.
#[derive(Debug, Clone)]
struct RunContext {
    run_id: String,
    path: PathBuf,
    fingerprint: String,
    started_at: DateTime<Utc>,
}

impl RunContext {
    fn new(path: PathBuf, fingerprint: String) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            path,
            fingerprint,
            started_at: Utc::now(),
        }
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    fn stage_key(&self) -> String {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "source".to_string());
        format!("{}_{}", stem, self.run_id)
    }

    fn report(&self, status: RunStatus) -> RunReport {
        RunReport {
            run_id: self.run_id.clone(),
            file: self.path.clone(),
            fingerprint: self.fingerprint.clone(),
            status,
            rows_read: 0,
            rows_accepted: 0,
            rows_quarantined: 0,
            inserted: 0,
            replaced: 0,
            audit_id: None,
            message: None,
            stage_path: None,
            quarantine_path: None,
        }
    }
}

fn audit_entry(ctx: &RunContext, report: &RunReport) -> NewAuditEntry {
    let path_text = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());
    NewAuditEntry {
        run_id: ctx.run_id.clone(),
        file_name: ctx.file_name(),
        file_path: ctx.path.display().to_string(),
        fingerprint: ctx.fingerprint.clone(),
        started_at: format_timestamp(&ctx.started_at),
        rows_read: report.rows_read as i64,
        rows_accepted: report.rows_accepted as i64,
        rows_quarantined: report.rows_quarantined as i64,
        status: report.status,
        message: report.message.clone(),
        stage_path: path_text(&report.stage_path),
        quarantine_path: path_text(&report.quarantine_path),
    }
}

/// Everything a run produces before it touches the warehouse.
struct PreparedRun {
    ctx: RunContext,
    report: RunReport,
}

pub struct Pipeline {
    config: PipelineConfig,
    normalizer: SchemaNormalizer,
    validator: DqValidator,
    stage_writer: StageWriter,
    quarantine: QuarantineStore,
    upserter: WarehouseUpserter,
    abort: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            normalizer: SchemaNormalizer::new(config.normalize.date_policy),
            validator: DqValidator::new(config.dq.clone())?,
            stage_writer: StageWriter::new(&config.paths.stage_dir, config.stage.columnar),
            quarantine: QuarantineStore::new(&config.paths.quarantine_dir),
            upserter: WarehouseUpserter::new(config.aggregation.period),
            abort: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Flag checked between runs and before each commit. Setting it rolls
    /// back the in-flight run and leaves the remaining files for later.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Create the warehouse and working directories, then report on the schema.
    pub fn init(&self) -> Result<SchemaReport> {
        fs::create_dir_all(&self.config.paths.stage_dir)?;
        fs::create_dir_all(&self.config.paths.quarantine_dir)?;
        let warehouse = Warehouse::open(&self.config.paths.warehouse)?;
        warehouse.verify()
    }

    /// Ingest every file matched by the configured discovery patterns.
    pub fn ingest(&self) -> Result<IngestSummary> {
        self.ingest_patterns(&self.config.discovery.patterns)
    }

    pub fn ingest_patterns(&self, patterns: &[String]) -> Result<IngestSummary> {
        let _lock = RunLock::acquire(self.config.paths.lock_path())?;
        let mut warehouse = Warehouse::open(&self.config.paths.warehouse)?;

        let files = discover_files(patterns)?;
        let mut summary = IngestSummary {
            files_discovered: files.len(),
            ..Default::default()
        };

        let mut admitted = Vec::new();
        for path in files {
            let admission = match IdempotencyGuard::check(warehouse.connection(), &path) {
                Ok(admission) => admission,
                Err(e) => {
                    let ctx = RunContext::new(path, String::new());
                    let report = ctx.report(RunStatus::Failed);
                    summary.runs.push(self.record_failure(&warehouse, &ctx, report, e.to_string())?);
                    continue;
                }
            };
            match admission {
                Admission::Admitted { fingerprint } => admitted.push(RunContext::new(path, fingerprint)),
                Admission::AlreadyLoaded { fingerprint, audit_id } => {
                    let ctx = RunContext::new(path, fingerprint);
                    summary.runs.push(self.record_skip(&warehouse, &ctx, audit_id)?);
                }
            }
        }

        let mut prepared = self.prepare_all(admitted)?.into_iter();
        for run in prepared.by_ref() {
            let report = self.merge_run(&mut warehouse, run)?;
            let aborted = report.status == RunStatus::Aborted;
            summary.runs.push(report);
            if aborted {
                summary.aborted = true;
                break;
            }
        }
        for run in prepared {
            warn!("Leaving {} for the next invocation", run.ctx.path.display());
            discard_artifacts(&run.report);
        }

        info!(
            "📊 Ingest summary: {} discovered, {} loaded, {} degraded, {} skipped, {} failed, {} aborted",
            summary.files_discovered,
            summary.count(RunStatus::Success),
            summary.count(RunStatus::Degraded),
            summary.count(RunStatus::Skipped),
            summary.count(RunStatus::Failed),
            summary.count(RunStatus::Aborted)
        );
        Ok(summary)
    }

    /// Read, normalize, validate and stage the admitted files on a bounded pool.
    /// Results come back in discovery order.
    fn prepare_all(&self, runs: Vec<RunContext>) -> Result<Vec<PreparedRun>> {
        if runs.is_empty() {
            return Ok(Vec::new());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.run.max_parallel_files)
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to build worker pool: {}", e)))?;

        info!("Preparing {} files on {} workers", runs.len(), self.config.run.max_parallel_files);
        Ok(pool.install(|| runs.into_par_iter().map(|ctx| self.prepare(ctx)).collect()))
    }

    fn prepare(&self, ctx: RunContext) -> PreparedRun {
        let mut report = ctx.report(RunStatus::Success);
        if self.aborted() {
            report.status = RunStatus::Aborted;
            return PreparedRun { ctx, report };
        }

        if let Err(e) = self.prepare_artifacts(&ctx, &mut report) {
            error!("❌ Failed to prepare {}: {}", ctx.path.display(), e);
            report.status = RunStatus::Failed;
            report.message = Some(e.to_string());
        }
        PreparedRun { ctx, report }
    }

    fn prepare_artifacts(&self, ctx: &RunContext, report: &mut RunReport) -> Result<()> {
        let table = read_source(&ctx.path)?;
        let headers = self
            .normalizer
            .map_headers(&table.headers)
            .map_err(|e| PipelineError::source_file(&ctx.path, e.to_string()))?;

        let source_file = ctx.file_name();
        let rows: Vec<NormalizedRow> = table
            .rows
            .into_iter()
            .map(|raw| {
                let candidate = self.normalizer.normalize(&headers, &raw, &source_file);
                (raw, candidate)
            })
            .collect();

        let batch = self.validator.validate_batch(&source_file, rows, ctx.started_at);
        self.apply_batch(ctx, &table.headers, batch, report)
    }

    fn apply_batch(
        &self,
        ctx: &RunContext,
        headers: &[String],
        batch: BatchValidation,
        report: &mut RunReport,
    ) -> Result<()> {
        report.rows_read = batch.rows_read;
        report.rows_accepted = batch.accepted.len();
        report.rows_quarantined = batch.quarantined.len();
        if self.validator.is_degraded(&batch) {
            report.status = RunStatus::Degraded;
            report.message = Some(format!(
                "quarantine rate {:.3} exceeds threshold {:.3}",
                batch.quarantine_rate(),
                self.validator.config().quarantine_rate_threshold
            ));
        }

        report.quarantine_path = self
            .quarantine
            .write(&ctx.path, &ctx.run_id, headers, &batch.quarantined)?;

        if !batch.accepted.is_empty() {
            let artifact = self.stage_writer.write(&ctx.stage_key(), &batch.accepted)?;
            report.stage_path = Some(artifact.path);
        }
        Ok(())
    }

    /// Merge one prepared run in its own transaction. Failures roll the
    /// transaction back and are audited separately.
    fn merge_run(&self, warehouse: &mut Warehouse, run: PreparedRun) -> Result<RunReport> {
        let PreparedRun { ctx, mut report } = run;

        if report.status == RunStatus::Failed {
            let message = report.message.clone().unwrap_or_default();
            return self.record_failure(warehouse, &ctx, report, message);
        }
        if report.status == RunStatus::Aborted || self.aborted() {
            return self.record_abort(warehouse, &ctx, report);
        }

        info!("=== Merging {} ({}) ===", ctx.file_name(), ctx.run_id);
        let result = warehouse.transaction(|tx| {
            // Byte-identical files found in the same invocation load once.
            if let Admission::AlreadyLoaded { audit_id, .. } =
                IdempotencyGuard::check_fingerprint(tx, &ctx.fingerprint)?
            {
                return Ok(Err(audit_id));
            }

            let records = match &report.stage_path {
                Some(path) => read_stage(path)?,
                None => Vec::new(),
            };
            let outcome = self.upserter.merge(tx, &records)?;
            aggregates::rebuild(tx, &outcome.periods)?;

            if self.aborted() {
                return Err(PipelineError::Aborted);
            }

            report.inserted = outcome.inserted;
            report.replaced = outcome.replaced;
            let audit_id = AuditRecorder::record(tx, &audit_entry(&ctx, &report))?;
            Ok(Ok(audit_id))
        });

        match result {
            Ok(Ok(audit_id)) => {
                report.audit_id = Some(audit_id);
                info!(
                    "✅ {} {}: {} read, {} accepted, {} quarantined",
                    ctx.file_name(),
                    report.status,
                    report.rows_read,
                    report.rows_accepted,
                    report.rows_quarantined
                );
                Ok(report)
            }
            Ok(Err(loaded_by)) => {
                discard_artifacts(&report);
                self.record_skip(warehouse, &ctx, loaded_by)
            }
            Err(PipelineError::Aborted) => self.record_abort(warehouse, &ctx, report),
            Err(e) => self.record_failure(warehouse, &ctx, report, e.to_string()),
        }
    }

    fn record_skip(&self, warehouse: &Warehouse, ctx: &RunContext, loaded_by: i64) -> Result<RunReport> {
        let mut report = ctx.report(RunStatus::Skipped);
        report.message = Some(format!("duplicate fingerprint; loaded by audit entry {}", loaded_by));
        report.audit_id = Some(AuditRecorder::record(warehouse.connection(), &audit_entry(ctx, &report))?);
        info!("⏭️ Skipped {} (unchanged content)", ctx.path.display());
        Ok(report)
    }

    fn record_failure(
        &self,
        warehouse: &Warehouse,
        ctx: &RunContext,
        mut report: RunReport,
        message: String,
    ) -> Result<RunReport> {
        error!("❌ Run {} for {} failed: {}", ctx.run_id, ctx.path.display(), message);
        report.status = RunStatus::Failed;
        report.message = Some(message);
        report.inserted = 0;
        report.replaced = 0;
        report.audit_id = Some(AuditRecorder::record(warehouse.connection(), &audit_entry(ctx, &report))?);
        Ok(report)
    }

    fn record_abort(&self, warehouse: &Warehouse, ctx: &RunContext, mut report: RunReport) -> Result<RunReport> {
        warn!("🛑 Run {} for {} aborted; nothing merged", ctx.run_id, ctx.path.display());
        discard_artifacts(&report);
        report.stage_path = None;
        report.quarantine_path = None;
        report.status = RunStatus::Aborted;
        report.message = Some(PipelineError::Aborted.to_string());
        report.inserted = 0;
        report.replaced = 0;
        report.audit_id = Some(AuditRecorder::record(warehouse.connection(), &audit_entry(ctx, &report))?);
        Ok(report)
    }

    /// Re-merge a stage artifact, e.g. after a warehouse restore. Audited like
    /// any other run, keyed by the artifact's own fingerprint.
    pub fn replay_stage(&self, artifact: &Path) -> Result<RunReport> {
        let _lock = RunLock::acquire(self.config.paths.lock_path())?;
        let mut warehouse = Warehouse::open(&self.config.paths.warehouse)?;

        let fingerprint = fingerprint_file(artifact)?;
        let ctx = RunContext::new(artifact.to_path_buf(), fingerprint);
        let mut report = ctx.report(RunStatus::Success);
        report.stage_path = Some(artifact.to_path_buf());

        info!("🔁 Replaying stage artifact {}", artifact.display());
        let result = warehouse.transaction(|tx| {
            let records = read_stage(artifact)?;
            report.rows_read = records.len();
            report.rows_accepted = records.len();

            let outcome = self.upserter.merge(tx, &records)?;
            aggregates::rebuild(tx, &outcome.periods)?;
            report.inserted = outcome.inserted;
            report.replaced = outcome.replaced;

            AuditRecorder::record(tx, &audit_entry(&ctx, &report))
        });

        match result {
            Ok(audit_id) => {
                report.audit_id = Some(audit_id);
                Ok(report)
            }
            Err(e) => self.record_failure(&warehouse, &ctx, report, e.to_string()),
        }
    }

    /// Recompute every metrics summary from the fact table.
    pub fn rebuild_metrics(&self) -> Result<usize> {
        let _lock = RunLock::acquire(self.config.paths.lock_path())?;
        let mut warehouse = Warehouse::open(&self.config.paths.warehouse)?;
        let period = self.config.aggregation.period;
        warehouse.transaction(|tx| aggregates::rebuild_all(tx, period))
    }
}

// Artifacts of runs that will never merge.
fn discard_artifacts(report: &RunReport) {
    for path in [&report.stage_path, &report.quarantine_path].into_iter().flatten() {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
