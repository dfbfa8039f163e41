//! `reelforge-core` -- domain types shared by every reelforge crate.
//!
//! Pure logic only: no filesystem, no network, no background tasks.
//! The agent capability, manifest persistence and rewriting seams are
//! declared here as traits and implemented by the outer crates.

pub mod agent;
pub mod completeness;
pub mod error;
pub mod health;
pub mod manifest;
pub mod naming;
pub mod partition;
pub mod types;
pub mod validation_status;
