//! Re-authentication guard.
//!
//! A session that gets signed out mid-job is recovered in place:
//! `reauthenticate`, settle, `setup` with the job's session URL, then the
//! generation mode is selected again. Attempts are bounded separately
//! from the restart ceiling, and a successful generation resets the
//! budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reelforge_agent::{HookError, RestartHook};
use reelforge_core::agent::{Agent, AgentFailure};
use reelforge_core::types::SlotId;

/// Why the guard could not restore the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Re-authentication attempts exhausted after {attempts}")]
    Exhausted { attempts: u32 },

    #[error("Re-authentication failed: {0}")]
    Failed(#[from] AgentFailure),
}

/// Per-agent re-login budget.
pub struct AuthGuard {
    slot: SlotId,
    max_attempts: u32,
    attempts: u32,
    settle: Duration,
    mode: Option<String>,
}

impl AuthGuard {
    pub fn new(slot: SlotId, max_attempts: u32) -> Self {
        Self {
            slot,
            max_attempts,
            attempts: 0,
            settle: Duration::ZERO,
            mode: None,
        }
    }

    /// Pause between re-authenticating and setting the session up again.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Mode re-selected after a successful re-login.
    pub fn with_mode(mut self, mode: Option<String>) -> Self {
        self.mode = mode;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// A generation went through; the budget starts over.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Check the session before a generation and recover it if signed out.
    pub async fn ensure_session(
        &mut self,
        agent: &dyn Agent,
        session_url: Option<&str>,
    ) -> Result<(), AuthError> {
        if !agent.is_logged_out().await {
            return Ok(());
        }
        tracing::warn!(slot_id = self.slot, "Session signed out");
        self.recover(agent, session_url).await
    }

    /// Spend one attempt re-authenticating.
    pub async fn recover(
        &mut self,
        agent: &dyn Agent,
        session_url: Option<&str>,
    ) -> Result<(), AuthError> {
        if self.is_exhausted() {
            tracing::error!(
                slot_id = self.slot,
                attempts = self.attempts,
                "Re-authentication budget exhausted"
            );
            return Err(AuthError::Exhausted {
                attempts: self.attempts,
            });
        }
        self.attempts += 1;
        tracing::info!(
            slot_id = self.slot,
            attempt = self.attempts,
            max = self.max_attempts,
            "Re-authenticating"
        );

        agent.reauthenticate().await?;
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        agent.setup(session_url).await?;
        if let Some(mode) = &self.mode {
            if let Err(e) = agent.switch_mode(mode).await {
                tracing::warn!(slot_id = self.slot, mode = %mode, error = %e, "Mode selection after re-login failed");
            }
        }
        tracing::info!(slot_id = self.slot, "Session restored");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Restart hook
// ---------------------------------------------------------------------------

/// Restart hook that signs a freshly restarted session back in.
///
/// A restarted browser frequently comes back signed out; catching it here
/// keeps the next generation from burning the worker's re-login budget.
pub struct ReauthOnRestart {
    agent: Arc<dyn Agent>,
}

impl ReauthOnRestart {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl RestartHook for ReauthOnRestart {
    async fn on_restart(&self, slot: SlotId) -> Result<(), HookError> {
        if self.agent.is_logged_out().await {
            tracing::info!(slot_id = slot, "Restarted session signed out, re-authenticating");
            self.agent.reauthenticate().await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use assert_matches::assert_matches;
    use reelforge_core::agent::{Artifact, GenerationRequest};

    use super::*;

    #[derive(Default)]
    struct SignedOutAgent {
        logged_out: AtomicBool,
        reauth_fails: AtomicBool,
        reauths: AtomicU32,
        setups: AtomicU32,
    }

    #[async_trait]
    impl Agent for SignedOutAgent {
        async fn setup(&self, _session_url: Option<&str>) -> Result<(), AgentFailure> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn generate_artifact(
            &self,
            _request: GenerationRequest,
        ) -> Result<Vec<Artifact>, AgentFailure> {
            Ok(Vec::new())
        }

        async fn switch_mode(&self, _mode: &str) -> Result<(), AgentFailure> {
            Ok(())
        }

        async fn close(&self) {}

        async fn is_logged_out(&self) -> bool {
            self.logged_out.load(Ordering::SeqCst)
        }

        async fn reauthenticate(&self) -> Result<(), AgentFailure> {
            self.reauths.fetch_add(1, Ordering::SeqCst);
            if self.reauth_fails.load(Ordering::SeqCst) {
                return Err(AgentFailure::unauthorized("login page did not accept"));
            }
            self.logged_out.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn signed_in_session_is_left_alone() {
        let agent = SignedOutAgent::default();
        let mut guard = AuthGuard::new(0, 3);
        guard.ensure_session(&agent, None).await.unwrap();
        assert_eq!(agent.reauths.load(Ordering::SeqCst), 0);
        assert_eq!(guard.attempts(), 0);
    }

    #[tokio::test]
    async fn signed_out_session_is_restored_with_setup() {
        let agent = SignedOutAgent::default();
        agent.logged_out.store(true, Ordering::SeqCst);
        let mut guard = AuthGuard::new(0, 3).with_mode(Some("image".into()));

        guard
            .ensure_session(&agent, Some("https://example.test/project/1"))
            .await
            .unwrap();
        assert_eq!(agent.reauths.load(Ordering::SeqCst), 1);
        assert_eq!(agent.setups.load(Ordering::SeqCst), 1);
        assert_eq!(guard.attempts(), 1);
    }

    #[tokio::test]
    async fn budget_is_bounded_and_reset_by_success() {
        let agent = SignedOutAgent::default();
        agent.reauth_fails.store(true, Ordering::SeqCst);
        let mut guard = AuthGuard::new(1, 3);

        for _ in 0..3 {
            assert_matches!(
                guard.recover(&agent, None).await,
                Err(AuthError::Failed(_))
            );
        }
        assert_matches!(
            guard.recover(&agent, None).await,
            Err(AuthError::Exhausted { attempts: 3 })
        );
        assert_eq!(agent.reauths.load(Ordering::SeqCst), 3);

        guard.reset();
        assert!(!guard.is_exhausted());
    }

    #[tokio::test]
    async fn restart_hook_reauthenticates_signed_out_session() {
        let agent = Arc::new(SignedOutAgent::default());
        agent.logged_out.store(true, Ordering::SeqCst);
        let hook = ReauthOnRestart::new(agent.clone());

        hook.on_restart(0).await.unwrap();
        assert_eq!(agent.reauths.load(Ordering::SeqCst), 1);
        assert!(!agent.is_logged_out().await);
    }
}
