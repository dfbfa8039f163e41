//! Reporting snapshot of the health registry.

use std::collections::BTreeMap;
use std::fmt;

use reelforge_core::health::AgentStatus;
use reelforge_core::types::{SlotId, Timestamp};
use serde::Serialize;

/// Per-slot detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSummary {
    pub status: AgentStatus,
    /// Consecutive errors since the last success or restart.
    pub error_count: u32,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub last_success: Option<Timestamp>,
}

/// Counts per status plus per-slot detail.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub running: usize,
    pub error: usize,
    pub restarting: usize,
    pub stopped: usize,
    pub per_slot: BTreeMap<SlotId, SlotSummary>,
}

impl RegistrySummary {
    pub fn from_slots(per_slot: BTreeMap<SlotId, SlotSummary>) -> Self {
        let count = |status: AgentStatus| per_slot.values().filter(|s| s.status == status).count();
        Self {
            total: per_slot.len(),
            running: count(AgentStatus::Running),
            error: count(AgentStatus::Error),
            restarting: count(AgentStatus::Restarting),
            stopped: count(AgentStatus::Stopped),
            per_slot,
        }
    }
}

/// One-line status, e.g. `agents=2 running=1 error=1 restarting=0 [0:running r0 e0] [1:error r2 e3]`.
impl fmt::Display for RegistrySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "agents={} running={} error={} restarting={}",
            self.total, self.running, self.error, self.restarting
        )?;
        for (slot, s) in &self.per_slot {
            write!(
                f,
                " [{slot}:{} r{} e{}]",
                s.status, s.restart_count, s.error_count
            )?;
        }
        Ok(())
    }
}
