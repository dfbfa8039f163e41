//! Agent supervision.
//!
//! - [`HealthRegistry`]: per-slot health tracking, bounded restarts and the
//!   background sweep monitor.
//! - [`ProcessAgent`]: an [`Agent`](reelforge_core::agent::Agent) that
//!   drives an external browser-driver executable.

pub mod process;
pub mod registry;
pub mod summary;

pub use process::{DriverError, ProcessAgent};
pub use registry::{HealthRegistry, HookError, RestartHook};
pub use summary::{RegistrySummary, SlotSummary};
