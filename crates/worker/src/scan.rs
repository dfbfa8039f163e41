//! Scan and dispatch loop.
//!
//! A [`Worker`] turns backlog entries into finished jobs:
//!
//! 1. skip jobs already published to the completed share
//! 2. take the claim lease (when enabled)
//! 3. claim or resume the local working copy
//! 4. run partitioned generation across every agent slot
//! 5. validate and fix the job's reference artifacts
//! 6. publish, delete the working copy and clean the raw source once the
//!    job is complete
//!
//! Skip-if-complete checks make every step safe to repeat, so a crash at
//! any point is recovered by the next scan.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reelforge_agent::HealthRegistry;
use reelforge_core::completeness::CompletionReport;
use reelforge_core::error::CoreError;
use reelforge_core::manifest::ManifestStore;
use reelforge_db::{JobStore, JsonManifestRepo, StoreError};
use reelforge_events::EventBus;
use reelforge_pipeline::{
    AgentSlot, JobRunner, ReferenceValidator, Rewriter, RunnerConfig, ValidatorConfig,
};
use tokio_util::sync::CancellationToken;

/// Failures that abort processing of one job.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Manifest of {0} became unreadable")]
    ManifestUnreadable(String),
}

/// What happened to one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Already on the completed share.
    AlreadyComplete,
    /// Another worker holds the lease.
    Leased,
    /// Not in the backlog.
    Missing,
    /// The manifest has no prompts yet.
    Empty,
    /// Work remains; the local copy is kept for the next scan.
    Incomplete(CompletionReport),
    Published(CompletionReport),
}

/// Knobs of the scan loop.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub worker_name: String,
    pub claim_leases: bool,
    pub lease_ttl: Duration,
    pub validate_references: bool,
    pub validator: ValidatorConfig,
    pub scan_interval: Duration,
}

/// Drives the backlog through the agent fleet.
pub struct Worker {
    store: JobStore,
    registry: Arc<HealthRegistry>,
    runner: JobRunner,
    slots: Vec<AgentSlot>,
    rewriter: Arc<dyn Rewriter>,
    options: ScanOptions,
    events: Option<Arc<EventBus>>,
}

impl Worker {
    pub fn new(
        store: JobStore,
        registry: Arc<HealthRegistry>,
        runner_config: RunnerConfig,
        slots: Vec<AgentSlot>,
        rewriter: Arc<dyn Rewriter>,
        options: ScanOptions,
    ) -> Self {
        let runner = JobRunner::new(Arc::clone(&registry), runner_config);
        Self {
            store,
            registry,
            runner,
            slots,
            rewriter,
            options,
            events: None,
        }
    }

    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.runner = self.runner.with_events(Arc::clone(&bus));
        self.events = Some(bus);
        self
    }

    /// Scan and process until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            worker = %self.options.worker_name,
            agents = self.slots.len(),
            interval_secs = self.options.scan_interval.as_secs(),
            "Scan loop started"
        );
        loop {
            let processed = self.scan_once(&cancel).await;
            if processed == 0 {
                tracing::debug!("No pending jobs");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.scan_interval) => {}
            }
        }
        tracing::info!("Scan loop stopped");
    }

    /// One pass over the backlog. Returns the number of jobs attempted.
    pub async fn scan_once(&self, cancel: &CancellationToken) -> usize {
        let codes = match self.store.scan_pending().await {
            Ok(codes) => codes,
            Err(e) => {
                tracing::error!(error = %e, "Backlog scan failed");
                return 0;
            }
        };
        if !codes.is_empty() {
            tracing::info!(count = codes.len(), "Pending jobs found");
        }

        let mut attempted = 0;
        for code in codes {
            if cancel.is_cancelled() {
                break;
            }
            attempted += 1;
            match self.process_job(&code).await {
                Ok(outcome) => tracing::info!(code = %code, outcome = ?outcome, "Job processed"),
                Err(e) => tracing::error!(code = %code, error = %e, "Job failed"),
            }
        }
        attempted
    }

    /// Process one job end to end.
    pub async fn process_job(&self, code: &str) -> Result<JobOutcome, WorkerError> {
        if self.store.is_complete_on_master(code).await {
            tracing::info!(code, "Job already complete on master, skipping");
            return Ok(JobOutcome::AlreadyComplete);
        }

        let lease = if self.options.claim_leases {
            match self
                .store
                .try_acquire_lease(code, &self.options.worker_name, self.options.lease_ttl)
                .await?
            {
                Some(lease) => Some(lease),
                None => return Ok(JobOutcome::Leased),
            }
        } else {
            None
        };

        let result = self.work_on(code).await;

        if let Some(lease) = &lease {
            if let Err(e) = self.store.release_lease(lease).await {
                tracing::warn!(code, error = %e, "Cannot release lease");
            }
        }

        tracing::info!(code, "{}", self.registry.summary().await);
        result
    }

    async fn work_on(&self, code: &str) -> Result<JobOutcome, WorkerError> {
        let Some(job_dir) = self.store.claim_local(code).await? else {
            return Ok(JobOutcome::Missing);
        };
        if !self.store.has_manifest_with_content(&job_dir, code).await {
            tracing::warn!(code, "Manifest has no prompts yet, skipping");
            return Ok(JobOutcome::Empty);
        }

        let manifest: Arc<dyn ManifestStore> = Arc::new(JsonManifestRepo::for_job(&job_dir, code));
        let report = self
            .runner
            .run(code, &job_dir, Arc::clone(&manifest), &self.slots)
            .await?;
        tracing::info!(
            code,
            generated = report.generated(),
            failed = report.failed(),
            "Generation pass finished"
        );

        if self.options.validate_references {
            self.validate(code, &job_dir, manifest).await?;
        }

        let completion = self
            .store
            .local_completion(code)
            .await
            .ok_or_else(|| WorkerError::ManifestUnreadable(code.to_string()))?;
        if !completion.is_complete() {
            tracing::info!(
                code,
                expected = completion.expected,
                done = completion.done,
                artifacts = completion.artifacts_found,
                "Job incomplete, keeping local copy"
            );
            return Ok(JobOutcome::Incomplete(completion));
        }

        self.store.publish(code).await?;
        self.store.delete_local(code).await?;
        let removed = self.store.cleanup_source(code).await?;
        tracing::info!(code, source_entries_removed = removed, "Job complete");
        Ok(JobOutcome::Published(completion))
    }

    /// Run validate-and-fix over the job's references with the first slot.
    async fn validate(
        &self,
        code: &str,
        job_dir: &Path,
        manifest: Arc<dyn ManifestStore>,
    ) -> Result<(), WorkerError> {
        let Some(first) = self.slots.first() else {
            return Ok(());
        };
        let healthy = self
            .registry
            .status(first.slot)
            .await
            .is_some_and(|s| s.is_healthy());
        if !healthy {
            tracing::warn!(code, slot_id = first.slot, "Validation agent unavailable, skipping validation");
            return Ok(());
        }

        let ids = manifest.list_items().await?;
        if ids.is_empty() {
            return Ok(());
        }

        let mut validator = ReferenceValidator::new(
            manifest,
            Arc::clone(&first.agent),
            Arc::clone(&self.rewriter),
        )
        .with_config(self.options.validator.clone())
        .with_job(code, job_dir);
        if let Some(bus) = &self.events {
            validator = validator.with_events(Arc::clone(bus));
        }

        let stats = validator.validate_all(&ids).await;
        tracing::info!(
            code,
            tested = stats.tested,
            fixed = stats.fixed,
            failed = stats.failed,
            "Reference validation finished"
        );
        Ok(())
    }
}
