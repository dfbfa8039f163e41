//! Agent health registry and restart supervisor.
//!
//! [`HealthRegistry`] keeps one [`AgentRecord`] per slot. Workers report
//! every generation outcome with [`mark_success`](HealthRegistry::mark_success)
//! and [`mark_error`](HealthRegistry::mark_error); those calls only touch
//! counters and are cheap. Recovery is centralised in
//! [`restart_agent`](HealthRegistry::restart_agent), which is serialised
//! across the whole registry and bounded by the restart ceiling.
//!
//! A background monitor ([`start_monitor`](HealthRegistry::start_monitor))
//! sweeps slots in `Error` on a fixed interval.
//!
//! The registry is constructed once at process start and handed to every
//! consumer as `Arc<HealthRegistry>`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reelforge_core::agent::Agent;
use reelforge_core::health::{AgentStatus, HealthPolicy};
use reelforge_core::types::{SlotId, Timestamp};
use reelforge_events::{EventBus, FleetEvent, FleetEventKind};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::summary::{RegistrySummary, SlotSummary};

/// How long [`HealthRegistry::stop_monitor`] waits for the monitor task.
const MONITOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// RestartHook
// ---------------------------------------------------------------------------

/// Error type returned by restart hooks. Never propagated.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Called after a slot was restarted successfully.
///
/// Errors are logged and swallowed; a failing hook never undoes a
/// restart.
#[async_trait]
pub trait RestartHook: Send + Sync {
    async fn on_restart(&self, slot: SlotId) -> Result<(), HookError>;
}

// ---------------------------------------------------------------------------
// AgentRecord
// ---------------------------------------------------------------------------

/// Health bookkeeping for one slot.
struct AgentRecord {
    agent: Arc<dyn Agent>,
    session_url: Option<String>,
    hook: Option<Arc<dyn RestartHook>>,
    status: AgentStatus,
    consecutive_errors: u32,
    restart_count: u32,
    last_success: Option<Timestamp>,
    last_error: Option<String>,
}

impl AgentRecord {
    fn summary(&self) -> SlotSummary {
        SlotSummary {
            status: self.status,
            error_count: self.consecutive_errors,
            restart_count: self.restart_count,
            last_error: self.last_error.clone(),
            last_success: self.last_success,
        }
    }
}

/// Running monitor task.
struct Monitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// HealthRegistry
// ---------------------------------------------------------------------------

/// Process-wide health coordinator for agent slots.
pub struct HealthRegistry {
    records: RwLock<HashMap<SlotId, AgentRecord>>,
    /// Serialises restarts so at most one slot is being recycled at a time.
    restart_lock: Mutex<()>,
    monitor: Mutex<Option<Monitor>>,
    policy: HealthPolicy,
    events: Option<Arc<EventBus>>,
}

impl HealthRegistry {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            restart_lock: Mutex::new(()),
            monitor: Mutex::new(None),
            policy,
            events: None,
        }
    }

    /// Publish registry transitions on `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    // ---- registration ----

    /// Track `agent` in `slot` with status `Running`.
    ///
    /// An existing record for the slot is replaced.
    pub async fn register(
        &self,
        slot: SlotId,
        agent: Arc<dyn Agent>,
        session_url: Option<String>,
        hook: Option<Arc<dyn RestartHook>>,
    ) {
        let record = AgentRecord {
            agent,
            session_url,
            hook,
            status: AgentStatus::Running,
            consecutive_errors: 0,
            restart_count: 0,
            last_success: None,
            last_error: None,
        };
        let replaced = self.records.write().await.insert(slot, record).is_some();
        if replaced {
            tracing::warn!(slot_id = slot, "Slot re-registered, previous record replaced");
        } else {
            tracing::info!(slot_id = slot, "Agent registered");
        }
        self.publish(FleetEvent::new(FleetEventKind::AgentRegistered).with_slot(slot));
    }

    /// Stop tracking `slot`. Returns its agent so the caller can close it.
    pub async fn unregister(&self, slot: SlotId) -> Option<Arc<dyn Agent>> {
        let record = self.records.write().await.remove(&slot)?;
        tracing::info!(slot_id = slot, "Agent unregistered");
        self.publish(FleetEvent::new(FleetEventKind::AgentUnregistered).with_slot(slot));
        Some(record.agent)
    }

    /// Update the resumption context used by future restarts of `slot`.
    pub async fn set_session_url(&self, slot: SlotId, session_url: Option<String>) {
        if let Some(record) = self.records.write().await.get_mut(&slot) {
            record.session_url = session_url;
        }
    }

    // ---- outcome reporting ----

    /// Record a successful generation.
    ///
    /// Resets the error counter. A healthy slot becomes `Running`; a slot
    /// in `Error` or `Restarting` keeps its status because only
    /// [`restart_agent`](Self::restart_agent) moves a slot out of those.
    pub async fn mark_success(&self, slot: SlotId) {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&slot) else {
            return;
        };
        record.consecutive_errors = 0;
        record.last_success = Some(Utc::now());
        if record.status.is_healthy() {
            record.status = AgentStatus::Running;
        }
    }

    /// Record a failed generation.
    ///
    /// Reaching the error threshold moves a healthy slot to `Error`,
    /// which makes it eligible for the next sweep. No restart happens
    /// here.
    pub async fn mark_error(&self, slot: SlotId, error: &str) {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&slot) else {
            return;
        };
        record.consecutive_errors += 1;
        record.last_error = Some(error.to_string());

        let count = record.consecutive_errors;
        if record.status.is_healthy() && self.policy.crosses_threshold(count) {
            record.status = AgentStatus::Error;
            drop(records);
            tracing::warn!(slot_id = slot, errors = count, error, "Agent marked as failed");
            self.publish(
                FleetEvent::new(FleetEventKind::ErrorThresholdReached)
                    .with_slot(slot)
                    .with_payload(serde_json::json!({ "errors": count, "last_error": error })),
            );
        } else {
            tracing::debug!(slot_id = slot, errors = count, error, "Agent error recorded");
        }
    }

    /// Mark a slot as finished with its work so sweeps leave it alone.
    pub async fn mark_stopped(&self, slot: SlotId) {
        if let Some(record) = self.records.write().await.get_mut(&slot) {
            record.status = AgentStatus::Stopped;
            tracing::info!(slot_id = slot, "Agent stopped");
        }
    }

    /// Bring a `Stopped` slot back to `Running` with a clean error count.
    ///
    /// Returns `false` for unknown slots and slots in any other status.
    /// The restart count is kept.
    pub async fn resume(&self, slot: SlotId) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&slot) else {
            return false;
        };
        if record.status != AgentStatus::Stopped {
            return false;
        }
        record.status = AgentStatus::Running;
        record.consecutive_errors = 0;
        tracing::info!(slot_id = slot, "Agent resumed");
        true
    }

    // ---- queries ----

    pub async fn status(&self, slot: SlotId) -> Option<AgentStatus> {
        self.records.read().await.get(&slot).map(|r| r.status)
    }

    /// Snapshot of one slot.
    pub async fn slot(&self, slot: SlotId) -> Option<SlotSummary> {
        self.records.read().await.get(&slot).map(AgentRecord::summary)
    }

    /// A slot in `Error` whose restart ceiling is used up.
    pub async fn is_exhausted(&self, slot: SlotId) -> bool {
        self.records.read().await.get(&slot).is_some_and(|r| {
            r.status == AgentStatus::Error && self.policy.is_exhausted(r.restart_count)
        })
    }

    /// Read-only snapshot of every slot, taken under one lock.
    pub async fn summary(&self) -> RegistrySummary {
        let records = self.records.read().await;
        let per_slot: BTreeMap<SlotId, SlotSummary> = records
            .iter()
            .map(|(slot, record)| (*slot, record.summary()))
            .collect();
        RegistrySummary::from_slots(per_slot)
    }

    // ---- recovery ----

    /// Close and set up the agent in `slot` again.
    ///
    /// Refuses (returns `false`, status unchanged) once the slot has used
    /// its restart ceiling. Otherwise the attempt counts against the
    /// ceiling whether or not setup succeeds.
    pub async fn restart_agent(&self, slot: SlotId) -> bool {
        self.restart(slot, false).await
    }

    /// Restart every slot in `Error`. Returns how many came back.
    ///
    /// Safe to call concurrently with itself and with outcome reporting:
    /// a slot that left `Error` before its turn is skipped.
    pub async fn sweep_and_restart_failed(&self) -> usize {
        let failed: Vec<SlotId> = {
            let records = self.records.read().await;
            let mut slots: Vec<SlotId> = records
                .iter()
                .filter(|(_, r)| {
                    r.status == AgentStatus::Error && !self.policy.is_exhausted(r.restart_count)
                })
                .map(|(slot, _)| *slot)
                .collect();
            slots.sort_unstable();
            slots
        };

        if failed.is_empty() {
            return 0;
        }
        tracing::info!(slots = ?failed, "Sweeping failed agents");

        let mut recovered = 0;
        for slot in failed {
            if self.restart(slot, true).await {
                recovered += 1;
            }
        }
        recovered
    }

    async fn restart(&self, slot: SlotId, only_if_failed: bool) -> bool {
        let _serial = self.restart_lock.lock().await;

        let (agent, session_url, attempt) = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(&slot) else {
                tracing::warn!(slot_id = slot, "Restart requested for unknown slot");
                return false;
            };
            if only_if_failed && record.status != AgentStatus::Error {
                return false;
            }
            if self.policy.is_exhausted(record.restart_count) {
                let restarts = record.restart_count;
                drop(records);
                tracing::error!(
                    slot_id = slot,
                    restarts,
                    "Restart ceiling reached, agent needs manual intervention"
                );
                self.publish(
                    FleetEvent::new(FleetEventKind::RestartCeilingReached)
                        .with_slot(slot)
                        .with_payload(serde_json::json!({ "restart_count": restarts })),
                );
                return false;
            }
            record.status = AgentStatus::Restarting;
            record.restart_count += 1;
            (
                Arc::clone(&record.agent),
                record.session_url.clone(),
                record.restart_count,
            )
        };

        tracing::info!(
            slot_id = slot,
            attempt,
            max = self.policy.max_restarts,
            "Restarting agent"
        );

        agent.close().await;
        tokio::time::sleep(self.policy.restart_settle).await;

        match agent.setup(session_url.as_deref()).await {
            Ok(()) => {
                if let Some(mode) = &self.policy.mode {
                    if let Err(e) = agent.switch_mode(mode).await {
                        tracing::warn!(slot_id = slot, mode = %mode, error = %e, "Mode selection after restart failed");
                    }
                }

                let hook = {
                    let mut records = self.records.write().await;
                    let Some(record) = records.get_mut(&slot) else {
                        return false;
                    };
                    record.status = AgentStatus::Running;
                    record.consecutive_errors = 0;
                    record.hook.clone()
                };

                tracing::info!(slot_id = slot, attempt, "Agent restarted");
                self.publish(
                    FleetEvent::new(FleetEventKind::AgentRestarted)
                        .with_slot(slot)
                        .with_payload(serde_json::json!({ "restart_count": attempt })),
                );

                if let Some(hook) = hook {
                    if let Err(e) = hook.on_restart(slot).await {
                        tracing::warn!(slot_id = slot, error = %e, "Restart hook failed");
                    }
                }
                true
            }
            Err(e) => {
                let message = e.to_string();
                if let Some(record) = self.records.write().await.get_mut(&slot) {
                    record.status = AgentStatus::Error;
                    record.last_error = Some(message.clone());
                }
                tracing::error!(slot_id = slot, attempt, error = %message, "Agent restart failed");
                self.publish(
                    FleetEvent::new(FleetEventKind::RestartFailed)
                        .with_slot(slot)
                        .with_payload(serde_json::json!({
                            "restart_count": attempt,
                            "error": message,
                        })),
                );
                false
            }
        }
    }

    // ---- monitor ----

    /// Spawn the background sweep loop. A second call while running is a
    /// no-op.
    pub async fn start_monitor(self: &Arc<Self>, interval: Duration) {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            tracing::debug!("Health monitor already running");
            return;
        }

        let cancel = CancellationToken::new();
        let registry = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "Health monitor started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let recovered = registry.sweep_and_restart_failed().await;
                        if recovered > 0 {
                            tracing::info!(recovered, "Health sweep recovered agents");
                        }
                    }
                }
            }
            tracing::info!("Health monitor stopped");
        });

        *monitor = Some(Monitor { cancel, handle });
    }

    /// Stop the sweep loop and wait briefly for it to exit.
    pub async fn stop_monitor(&self) {
        let Some(monitor) = self.monitor.lock().await.take() else {
            return;
        };
        monitor.cancel.cancel();
        if tokio::time::timeout(MONITOR_SHUTDOWN_TIMEOUT, monitor.handle)
            .await
            .is_err()
        {
            tracing::warn!("Health monitor did not stop in time");
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.monitor.lock().await.is_some()
    }

    /// Stop the monitor, close every agent, and forget all slots.
    ///
    /// Close is best-effort: agents log their own failures.
    pub async fn close_all(&self) {
        self.stop_monitor().await;
        let drained: Vec<(SlotId, AgentRecord)> = self.records.write().await.drain().collect();
        for (slot, record) in drained {
            tracing::info!(slot_id = slot, "Closing agent");
            record.agent.close().await;
        }
    }

    fn publish(&self, event: FleetEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
