//! Job execution.
//!
//! - [`JobRunner`]: partitioned parallel dispatch of one job's sub-tasks
//!   across agent slots.
//! - [`ReferenceValidator`]: the resumable validate-and-fix workflow for
//!   reference artifacts.
//! - [`Rewriter`]: prompt rewriting used by the fix path.
//! - [`AuthGuard`]: bounded re-login for signed-out sessions.

pub mod auth;
pub mod rewrite;
pub mod runner;
pub mod validator;

pub use auth::{AuthError, AuthGuard, ReauthOnRestart};
pub use rewrite::{ChatRewriter, DisabledRewriter, RewriteError, Rewriter};
pub use runner::{AgentSlot, JobReport, JobRunner, PartitionReport, RunnerConfig, StopReason};
pub use validator::{
    FixStage, ItemOutcome, ReferenceValidator, ValidationStats, ValidatorConfig,
};
