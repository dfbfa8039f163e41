//! Partitioned parallel dispatch of one job across agent slots.
//!
//! [`JobRunner::run`] takes a snapshot of the job's manifest, splits the
//! sub-tasks that carry a prompt across the given slots with
//! [`plan`](reelforge_core::partition::plan), and runs every slot's share
//! in its own task. Slots never coordinate: the split is disjoint and
//! every sub-task is skipped when its output file already exists, so
//! re-running a half-finished job only does the missing work.
//!
//! Each slot reports outcomes to the [`HealthRegistry`] and waits while
//! the supervisor recovers it. Policy rejections never count against
//! agent health.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reelforge_agent::HealthRegistry;
use reelforge_core::agent::{Agent, ArtifactRef, FailureKind, GenerationRequest};
use reelforge_core::error::CoreError;
use reelforge_core::health::{AgentStatus, DEFAULT_MAX_RELOGIN_ATTEMPTS};
use reelforge_core::manifest::{ItemUpdate, Manifest, ManifestStore, Subtask, SubtaskStatus};
use reelforge_core::naming::{artifact_file_names, image_file_name, ARTIFACT_DIR};
use reelforge_core::partition::{plan, Responsibility};
use reelforge_core::types::SlotId;
use reelforge_events::{EventBus, FleetEvent, FleetEventKind};
use serde::Serialize;

use crate::auth::{AuthError, AuthGuard, ReauthOnRestart};

/// How often a slot re-checks its health while the supervisor works.
const HEALTH_POLL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// One agent taking part in a job.
#[derive(Clone)]
pub struct AgentSlot {
    pub slot: SlotId,
    pub agent: Arc<dyn Agent>,
    pub responsibility: Responsibility,
}

impl AgentSlot {
    pub fn new(slot: SlotId, agent: Arc<dyn Agent>) -> Self {
        Self {
            slot,
            agent,
            responsibility: Responsibility::All,
        }
    }

    pub fn with_responsibility(mut self, responsibility: Responsibility) -> Self {
        self.responsibility = responsibility;
        self
    }
}

/// Tunables for [`JobRunner`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Mode selected after setup.
    pub mode: Option<String>,
    /// Delay between starting consecutive slots.
    pub start_stagger: Duration,
    pub max_relogin_attempts: u32,
    /// Pause between re-login and setup.
    pub relogin_settle: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            mode: None,
            start_stagger: Duration::ZERO,
            max_relogin_attempts: DEFAULT_MAX_RELOGIN_ATTEMPTS,
            relogin_settle: Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Why a slot stopped before finishing its share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The slot left the registry or was stopped during the job.
    Unavailable,
    SetupFailed,
    RestartsExhausted,
    AuthExhausted,
    Store(String),
}

/// What one slot did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionReport {
    pub slot: SlotId,
    pub assigned: usize,
    pub generated: usize,
    /// Already done, or an output file was already present.
    pub skipped: usize,
    pub failed: usize,
    pub stopped: Option<StopReason>,
}

/// What the whole job run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub code: String,
    pub partitions: Vec<PartitionReport>,
}

impl JobReport {
    pub fn generated(&self) -> usize {
        self.partitions.iter().map(|p| p.generated).sum()
    }

    pub fn failed(&self) -> usize {
        self.partitions.iter().map(|p| p.failed).sum()
    }
}

// ---------------------------------------------------------------------------
// JobRunner
// ---------------------------------------------------------------------------

/// Runs one job's generation across several agent slots.
pub struct JobRunner {
    registry: Arc<HealthRegistry>,
    config: RunnerConfig,
    events: Option<Arc<EventBus>>,
}

/// Everything one slot task needs.
struct SlotContext {
    code: String,
    job_dir: PathBuf,
    session_url: Option<String>,
    store: Arc<dyn ManifestStore>,
    registry: Arc<HealthRegistry>,
    config: RunnerConfig,
    slot: AgentSlot,
    items: Vec<Subtask>,
}

impl JobRunner {
    pub fn new(registry: Arc<HealthRegistry>, config: RunnerConfig) -> Self {
        Self {
            registry,
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Generate every missing artifact of `code` using `slots`.
    ///
    /// Each category is split by position among the slots responsible
    /// for it, so slot `i` of `n` identical slots takes every `i`-th
    /// sub-task. Returns once every slot has finished or stopped.
    pub async fn run(
        &self,
        code: &str,
        job_dir: &Path,
        store: Arc<dyn ManifestStore>,
        slots: &[AgentSlot],
    ) -> Result<JobReport, CoreError> {
        let manifest = store.load().await?;
        let candidates = work_items(&manifest);
        let total = slots.len();

        tracing::info!(
            code,
            agents = total,
            items = candidates.len(),
            "Dispatching job"
        );
        self.publish(
            FleetEvent::new(FleetEventKind::JobStarted)
                .with_code(code)
                .with_payload(serde_json::json!({ "agents": total, "items": candidates.len() })),
        );

        let responsibilities: Vec<Responsibility> = slots.iter().map(|s| s.responsibility).collect();
        let shares = plan(&candidates, &responsibilities, |s| s.id.as_str());
        let unassigned = candidates.len() - shares.iter().map(Vec::len).sum::<usize>();
        if unassigned > 0 {
            tracing::warn!(code, unassigned, "No slot is responsible for some sub-tasks");
        }

        let mut handles = Vec::with_capacity(total);
        for ((index, slot), items) in slots.iter().enumerate().zip(shares) {
            tracing::info!(
                code,
                slot_id = slot.slot,
                index,
                assigned = items.len(),
                "Partition assigned"
            );

            let ctx = SlotContext {
                code: code.to_string(),
                job_dir: job_dir.to_path_buf(),
                session_url: manifest.session_url.clone(),
                store: Arc::clone(&store),
                registry: Arc::clone(&self.registry),
                config: self.config.clone(),
                slot: slot.clone(),
                items,
            };
            let delay = self.config.start_stagger * index as u32;
            handles.push(tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                run_partition(ctx).await
            }));
        }

        let mut report = JobReport {
            code: code.to_string(),
            partitions: Vec::with_capacity(total),
        };
        for (joined, slot) in futures::future::join_all(handles).await.into_iter().zip(slots) {
            match joined {
                Ok(partition) => report.partitions.push(partition),
                Err(e) => {
                    tracing::error!(code, slot_id = slot.slot, error = %e, "Partition task panicked");
                    report.partitions.push(PartitionReport {
                        slot: slot.slot,
                        stopped: Some(StopReason::Store(e.to_string())),
                        ..Default::default()
                    });
                }
            }
        }

        tracing::info!(
            code,
            generated = report.generated(),
            failed = report.failed(),
            "Job dispatch finished"
        );
        self.publish(
            FleetEvent::new(FleetEventKind::JobFinished)
                .with_code(code)
                .with_payload(serde_json::to_value(&report).unwrap_or_default()),
        );
        Ok(report)
    }

    fn publish(&self, event: FleetEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

/// Sub-tasks that can be partitioned, in manifest order.
///
/// The list covers finished items too so the split is the same on every
/// run of the job.
fn work_items(manifest: &Manifest) -> Vec<Subtask> {
    manifest
        .subtasks
        .iter()
        .filter(|s| s.has_prompt() && s.status != SubtaskStatus::Skip)
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Per-slot loop
// ---------------------------------------------------------------------------

async fn run_partition(ctx: SlotContext) -> PartitionReport {
    let slot_id = ctx.slot.slot;
    let agent = Arc::clone(&ctx.slot.agent);
    let mut report = PartitionReport {
        slot: slot_id,
        assigned: ctx.items.len(),
        ..Default::default()
    };

    match ctx.registry.status(slot_id).await {
        None => {
            let hook = Arc::new(ReauthOnRestart::new(Arc::clone(&agent)));
            ctx.registry
                .register(slot_id, Arc::clone(&agent), ctx.session_url.clone(), Some(hook))
                .await;
        }
        Some(AgentStatus::Stopped) => {
            // Stopped only lasts for the job that stopped it.
            ctx.registry.resume(slot_id).await;
            ctx.registry
                .set_session_url(slot_id, ctx.session_url.clone())
                .await;
        }
        Some(_) => {
            ctx.registry
                .set_session_url(slot_id, ctx.session_url.clone())
                .await;
        }
    }

    if ctx.registry.is_exhausted(slot_id).await {
        tracing::warn!(code = %ctx.code, slot_id, "Slot exhausted its restarts, skipping partition");
        report.stopped = Some(StopReason::RestartsExhausted);
        return report;
    }

    if !open_session(&ctx, agent.as_ref()).await {
        report.stopped = Some(StopReason::SetupFailed);
        return report;
    }

    let mut guard = AuthGuard::new(slot_id, ctx.config.max_relogin_attempts)
        .with_settle(ctx.config.relogin_settle)
        .with_mode(ctx.config.mode.clone());

    for item in &ctx.items {
        if matches!(item.status, SubtaskStatus::Done) {
            report.skipped += 1;
            continue;
        }
        if output_exists(&ctx.job_dir, &item.id).await {
            tracing::info!(code = %ctx.code, slot_id, item = %item.id, "Output already exists, skipping");
            if let Err(e) = ctx
                .store
                .write_item(&item.id, ItemUpdate::default().with_status(SubtaskStatus::Done))
                .await
            {
                report.stopped = Some(StopReason::Store(e.to_string()));
                return report;
            }
            report.skipped += 1;
            continue;
        }

        if let Some(reason) = wait_until_healthy(&ctx.registry, slot_id).await {
            report.stopped = Some(reason);
            return report;
        }

        match guard
            .ensure_session(agent.as_ref(), ctx.session_url.as_deref())
            .await
        {
            Ok(()) => {}
            Err(AuthError::Exhausted { .. }) => {
                ctx.registry.mark_stopped(slot_id).await;
                report.stopped = Some(StopReason::AuthExhausted);
                return report;
            }
            Err(AuthError::Failed(e)) => {
                tracing::warn!(code = %ctx.code, slot_id, item = %item.id, error = %e, "Re-login failed");
                report.failed += 1;
                continue;
            }
        }

        match generate_one(&ctx, agent.as_ref(), item).await {
            Ok(Some(handle)) => {
                if let Err(e) = ctx
                    .store
                    .write_item(
                        &item.id,
                        ItemUpdate::default()
                            .with_status(SubtaskStatus::Done)
                            .with_media_id(handle),
                    )
                    .await
                {
                    report.stopped = Some(StopReason::Store(e.to_string()));
                    return report;
                }
                ctx.registry.mark_success(slot_id).await;
                guard.reset();
                report.generated += 1;
            }
            Ok(None) => {
                report.failed += 1;
            }
            Err(kind) => {
                report.failed += 1;
                if kind == FailureKind::PolicyViolation {
                    if let Err(e) = ctx
                        .store
                        .write_item(&item.id, ItemUpdate::default().with_status(SubtaskStatus::Error))
                        .await
                    {
                        report.stopped = Some(StopReason::Store(e.to_string()));
                        return report;
                    }
                }
                if kind == FailureKind::Unauthorized {
                    if let Err(AuthError::Exhausted { .. }) = guard
                        .recover(agent.as_ref(), ctx.session_url.as_deref())
                        .await
                    {
                        ctx.registry.mark_stopped(slot_id).await;
                        report.stopped = Some(StopReason::AuthExhausted);
                        return report;
                    }
                }
            }
        }
    }

    tracing::info!(
        code = %ctx.code,
        slot_id,
        generated = report.generated,
        skipped = report.skipped,
        failed = report.failed,
        "Partition finished"
    );
    report
}

/// Set the session up for this job, leaning on the supervisor once if
/// setup fails.
async fn open_session(ctx: &SlotContext, agent: &dyn Agent) -> bool {
    let slot_id = ctx.slot.slot;
    match agent.setup(ctx.session_url.as_deref()).await {
        Ok(()) => {
            if let Some(mode) = &ctx.config.mode {
                if let Err(e) = agent.switch_mode(mode).await {
                    tracing::warn!(slot_id, mode = %mode, error = %e, "Mode selection failed");
                }
            }
            true
        }
        Err(e) => {
            tracing::error!(code = %ctx.code, slot_id, error = %e, "Agent setup failed");
            ctx.registry.mark_error(slot_id, &e.to_string()).await;
            ctx.registry.restart_agent(slot_id).await
        }
    }
}

/// Wait while the supervisor owns the slot. Returns a reason to stop.
async fn wait_until_healthy(registry: &HealthRegistry, slot: SlotId) -> Option<StopReason> {
    let mut announced = false;
    loop {
        match registry.status(slot).await {
            Some(status) if status.is_healthy() => return None,
            Some(AgentStatus::Restarting) | Some(AgentStatus::Error) => {
                if registry.is_exhausted(slot).await {
                    return Some(StopReason::RestartsExhausted);
                }
                if !announced {
                    tracing::info!(slot_id = slot, "Waiting for supervisor to recover agent");
                    announced = true;
                }
                tokio::time::sleep(HEALTH_POLL).await;
            }
            _ => return Some(StopReason::Unavailable),
        }
    }
}

/// Generate one sub-task. `Ok(None)` means the agent succeeded without a
/// usable handle.
async fn generate_one(
    ctx: &SlotContext,
    agent: &dyn Agent,
    item: &Subtask,
) -> Result<Option<String>, FailureKind> {
    let slot_id = ctx.slot.slot;
    let references = match reference_handles(ctx.store.as_ref(), &item.references).await {
        Ok(refs) => refs,
        Err(e) => {
            tracing::error!(slot_id, item = %item.id, error = %e, "Cannot read reference handles");
            return Ok(None);
        }
    };

    let output = ctx.job_dir.join(ARTIFACT_DIR).join(image_file_name(&item.id));
    let request = GenerationRequest::new(item.prompt.clone())
        .with_references(references)
        .with_output(output);

    tracing::info!(code = %ctx.code, slot_id, item = %item.id, "Generating");
    match agent.generate_artifact(request).await {
        Ok(artifacts) => {
            let handle = artifacts
                .into_iter()
                .map(|a| a.handle)
                .find(|h| !h.is_empty());
            if handle.is_none() {
                tracing::warn!(slot_id, item = %item.id, "Generation returned no handle");
                ctx.registry
                    .mark_error(slot_id, "generation returned no artifact")
                    .await;
            }
            Ok(handle)
        }
        Err(failure) => {
            tracing::warn!(
                code = %ctx.code,
                slot_id,
                item = %item.id,
                kind = %failure.kind,
                message = %failure.message,
                "Generation failed"
            );
            if failure.kind.counts_against_health() {
                ctx.registry.mark_error(slot_id, &failure.message).await;
            }
            Err(failure.kind)
        }
    }
}

/// Current handles of the references a scene uses. Missing or empty
/// handles are left out.
async fn reference_handles(
    store: &dyn ManifestStore,
    ids: &[String],
) -> Result<Vec<ArtifactRef>, CoreError> {
    let mut refs = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(record) = store.read_item(id).await? {
            if !record.media_id.is_empty() {
                refs.push(ArtifactRef::new(record.media_id));
            }
        }
    }
    Ok(refs)
}

/// Whether `<job_dir>/img/<id>.png` or `.mp4` exists.
async fn output_exists(job_dir: &Path, id: &str) -> bool {
    let dir = job_dir.join(ARTIFACT_DIR);
    for name in artifact_file_names(id) {
        if tokio::fs::try_exists(dir.join(name)).await.unwrap_or(false) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_items_keep_done_and_drop_skipped_or_empty() {
        let mut m = Manifest::new("AR1-0001");
        let mut done = Subtask::new("1", "a");
        done.status = SubtaskStatus::Done;
        let mut skip = Subtask::new("2", "b");
        skip.status = SubtaskStatus::Skip;
        m.subtasks = vec![done, skip, Subtask::new("3", ""), Subtask::new("4", "d")];

        let ids: Vec<String> = work_items(&m).into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["1", "4"]);
    }

    #[test]
    fn report_totals() {
        let report = JobReport {
            code: "AR1-0001".into(),
            partitions: vec![
                PartitionReport {
                    slot: 0,
                    generated: 2,
                    failed: 1,
                    ..Default::default()
                },
                PartitionReport {
                    slot: 1,
                    generated: 3,
                    ..Default::default()
                },
            ],
        };
        assert_eq!(report.generated(), 5);
        assert_eq!(report.failed(), 1);
    }

    #[tokio::test]
    async fn output_exists_checks_png_and_mp4() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("img")).unwrap();
        std::fs::write(dir.path().join("img/7.mp4"), b"v").unwrap();
        assert!(output_exists(dir.path(), "7").await);
        assert!(!output_exists(dir.path(), "8").await);
    }
}
