//! `reelforge-worker` -- configuration and the scan/dispatch loop behind
//! the `reelforge-worker` binary.

pub mod config;
pub mod scan;

pub use config::{ConfigError, WorkerConfig};
pub use scan::{JobOutcome, ScanOptions, Worker, WorkerError};
