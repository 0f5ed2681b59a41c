//! Pipeline orchestrator
//!
//! COLLECT → ANALYZE → MONITOR_COMPLIANCE → ADVISE → DOCUMENT → REPORT → DONE,
//! with FAILED reachable from any stage. Stages run in order on one context;
//! the first failure stops the run.

use crate::audit::{AuditLog, RunRecord};
use crate::calendar::{Clock, FiscalCalendar};
use crate::config::OrchestratorConfig;
use crate::execution::{
    RetryPolicy, StageExecutor, PATTERN_CADENCE, PATTERN_COMPLIANCE_STATUS, PATTERN_PERIOD,
};
use crate::memory::{MemoryRecord, MemoryStore};
use crate::models::{FiscalContext, RunOutcome, RunRequest, Stage};
use crate::publication::PublicationStore;
use crate::tax::create_default_engine;
use crate::tools::{create_default_delivery, HttpCollector};
use crate::verification::create_default_compliance_monitor;
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Orchestrator {
    executor: StageExecutor,
    memory: Arc<MemoryStore>,
    publications: Arc<PublicationStore>,
    audit_log: AuditLog,
    memory_path: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        executor: StageExecutor,
        memory: Arc<MemoryStore>,
        publications: Arc<PublicationStore>,
        audit_log: AuditLog,
    ) -> Self {
        Self {
            executor,
            memory,
            publications,
            audit_log,
            memory_path: None,
        }
    }

    /// Persist memory to `path` after every completed run.
    pub fn with_memory_path(mut self, path: PathBuf) -> Self {
        self.memory_path = Some(path);
        self
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn publications(&self) -> &Arc<PublicationStore> {
        &self.publications
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit_log
    }

    pub fn executor(&self) -> &StageExecutor {
        &self.executor
    }

    /// Run the pipeline for one period.
    ///
    /// A stage failure is not an `Err`: the outcome carries a FAILED context
    /// with the failing stage and reason. `Err` is reserved for the audit
    /// log itself failing.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        let start_time = Instant::now();
        let reference_date = self.executor.calendar().today();

        let mut ctx = FiscalContext::new(
            Uuid::new_v4(),
            request.period.clone(),
            reference_date,
            request.preferences.clone(),
        );

        info!(
            run_id = %ctx.run_id,
            period = %ctx.period.label(),
            cadence = %ctx.period.cadence,
            jurisdiction = self.executor.jurisdiction(),
            "Orchestrator: starting run"
        );

        for stage in Stage::ORDER {
            ctx.begin_stage(stage);

            match self.executor.execute(stage, &mut ctx, &request).await {
                Ok(()) => {
                    ctx.complete_stage(stage);
                    debug!(run_id = %ctx.run_id, stage = %stage, "Stage completed");
                }
                Err(e) => {
                    warn!(
                        run_id = %ctx.run_id,
                        stage = %stage,
                        kind = ?e.kind(),
                        error = %e,
                        "Stage failed, halting run"
                    );
                    ctx.fail(stage, &e);
                    break;
                }
            }
        }

        let mut publication_id = None;

        if !ctx.is_failed() {
            ctx.finish();

            self.memory.append(memory_record(&ctx)).await;
            if let Some(path) = &self.memory_path {
                if let Err(e) = self.memory.save_to(path).await {
                    warn!(run_id = %ctx.run_id, error = %e, "Could not persist memory");
                }
            }

            if let Some(draft) = ctx.publication_draft.clone() {
                let item = self.publications.create(draft, Some(ctx.run_id)).await;
                publication_id = Some(item.id);
            }
        }

        let run_id = ctx.run_id;
        let status = ctx.status;
        let record = RunRecord::new(ctx.clone(), publication_id, start_time.elapsed().as_millis() as u64);
        let audit_id = self.audit_log.record(record).await?;

        info!(
            run_id = %run_id,
            audit_id = %audit_id,
            status = ?status,
            publication_id = ?publication_id,
            "Orchestrator: run finished"
        );

        Ok(RunOutcome {
            context: ctx,
            audit_id,
            publication_id,
        })
    }
}

/// Wire the production collaborators from configuration.
pub async fn create_default_orchestrator(config: &OrchestratorConfig, clock: Arc<dyn Clock>) -> Result<Orchestrator> {
    let calendar = match &config.calendar_seed_path {
        Some(path) => FiscalCalendar::from_path(path, clock)?,
        None => FiscalCalendar::with_default_seeds(clock)?,
    };

    let memory = Arc::new(match &config.memory_path {
        Some(path) => MemoryStore::load_from(path, config.memory_capacity).await?,
        None => MemoryStore::new(config.memory_capacity),
    });

    let mut engine = create_default_engine()?;
    if let Some(path) = &config.tax_rules_path {
        engine.load_rules(path)?;
    }

    let mut executor = StageExecutor::new(
        Arc::new(engine),
        Arc::new(calendar),
        memory.clone(),
        create_default_compliance_monitor(),
        &config.jurisdiction,
    )
    .with_retry_policy(RetryPolicy {
        max_attempts: config.collector_max_attempts,
        initial_backoff: config.collector_backoff,
    })
    .with_alert_window(config.alert_window_days);

    if let Some(url) = &config.collector_url {
        executor = executor.with_collector(Arc::new(HttpCollector::new(url.as_str())?));
    }

    let delivery = create_default_delivery(config.webhook_url.as_deref())?;
    let publications = Arc::new(PublicationStore::new(delivery, config.delivery_action.clone()));

    let mut orchestrator = Orchestrator::new(executor, memory, publications, AuditLog::new());
    if let Some(path) = &config.memory_path {
        orchestrator = orchestrator.with_memory_path(path.clone());
    }

    info!(
        jurisdiction = %config.jurisdiction,
        memory_capacity = config.memory_capacity,
        webhook = config.webhook_url.is_some(),
        "Orchestrator initialized"
    );

    Ok(orchestrator)
}

/// The one memory record a completed run leaves behind.
fn memory_record(ctx: &FiscalContext) -> MemoryRecord {
    let label = ctx.period.label();
    let status = ctx
        .compliance
        .as_ref()
        .map(|c| c.status.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let remittance = ctx
        .tax_summary
        .as_ref()
        .map(|s| s.total_remittance.to_string())
        .unwrap_or_default();

    MemoryRecord::new(format!(
        "{} run {}: {} records, status {}, remittance {}",
        ctx.period.cadence,
        label,
        ctx.records.len(),
        status,
        remittance
    ))
    .with_pattern(PATTERN_PERIOD, label)
    .with_pattern(PATTERN_CADENCE, ctx.period.cadence.as_str())
    .with_pattern(PATTERN_COMPLIANCE_STATUS, status)
    .with_preferences(ctx.preferences.clone())
}
