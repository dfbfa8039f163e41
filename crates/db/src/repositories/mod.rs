//! Filesystem repositories.

pub mod job_repo;
pub mod manifest_repo;

pub use job_repo::{JobStore, JobStoreLayout, Lease};
pub use manifest_repo::JsonManifestRepo;
