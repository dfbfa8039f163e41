//! `reelforge-db` -- persistence for job manifests and the job backlog.
//!
//! Everything lives on (possibly shared) filesystems: the manifest is a
//! JSON document inside each job directory, and the backlog is a tree of
//! job directories on a master share with per-machine working copies.

pub mod error;
pub mod repositories;

pub use error::StoreError;
pub use repositories::{JobStore, JobStoreLayout, JsonManifestRepo, Lease};
