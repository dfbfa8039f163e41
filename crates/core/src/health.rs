//! Agent health constants and status values.
//!
//! Shared by the health registry and the workers that report into it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Restarts allowed per slot before it is permanently excluded from
/// automatic recovery.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Consecutive errors that move a slot into [`AgentStatus::Error`].
pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;

/// Pause between closing an agent and setting it up again.
pub const DEFAULT_RESTART_SETTLE: Duration = Duration::from_secs(2);

/// How often the monitor sweeps for failed slots.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Re-authentication attempts allowed before a worker gives up.
pub const DEFAULT_MAX_RELOGIN_ATTEMPTS: u32 = 3;

/// Mode re-applied after every successful setup.
pub const DEFAULT_AGENT_MODE: &str = "image";

// ---------------------------------------------------------------------------
// AgentStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of one agent slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    /// Too many consecutive errors; eligible for restart.
    Error,
    Restarting,
    Stopped,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
            AgentStatus::Error => "error",
            AgentStatus::Restarting => "restarting",
            AgentStatus::Stopped => "stopped",
        }
    }

    /// A slot that can take work right now.
    pub fn is_healthy(&self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Running)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// HealthPolicy
// ---------------------------------------------------------------------------

/// Tunables for the health registry.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub max_restarts: u32,
    pub error_threshold: u32,
    pub restart_settle: Duration,
    /// Mode re-selected after a successful restart, if any.
    pub mode: Option<String>,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            restart_settle: DEFAULT_RESTART_SETTLE,
            mode: Some(DEFAULT_AGENT_MODE.to_string()),
        }
    }
}

impl HealthPolicy {
    /// Whether `restart_count` has used up the ceiling.
    pub fn is_exhausted(&self, restart_count: u32) -> bool {
        restart_count >= self.max_restarts
    }

    /// Whether `consecutive_errors` reaches the error threshold.
    pub fn crosses_threshold(&self, consecutive_errors: u32) -> bool {
        consecutive_errors >= self.error_threshold
    }
}
