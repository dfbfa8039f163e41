//! Reelforge fleet event bus.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`FleetEvent`]: the event envelope (agent restarts, workflow status
//!   transitions, job boundaries).
//! - [`EventReporter`]: background task that logs every event.

pub mod bus;
pub mod reporter;

pub use bus::{EventBus, FleetEvent, FleetEventKind};
pub use reporter::EventReporter;
