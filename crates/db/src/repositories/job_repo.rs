//! Directory-per-job backlog.
//!
//! Layout:
//!
//! | Path                         | Owner          | Meaning                         |
//! |------------------------------|----------------|---------------------------------|
//! | `<master>/<code>/`           | shared         | backlog copy of the job         |
//! | `<completed>/<code>/`        | shared         | published output; job is done   |
//! | `<local>/<code>/`            | this machine   | working copy being generated    |
//! | `<source>/<channel>/<code>*` | shared         | raw inputs, removed on success  |
//!
//! Nothing here takes a distributed lock except the optional lease file
//! (see [`JobStore::try_acquire_lease`]). Safety otherwise comes from
//! skip-if-complete checks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use reelforge_core::completeness::{evaluate, CompletionReport};
use reelforge_core::naming::{
    channel_of, is_artifact_file, matches_channel, names_code, validate_project_code, ARTIFACT_DIR,
};
use reelforge_core::types::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;
use crate::repositories::manifest_repo::JsonManifestRepo;

/// File name of the claim lease inside a master job directory.
pub const LEASE_FILE_NAME: &str = ".lease";

/// Directory roots of the backlog.
#[derive(Debug, Clone)]
pub struct JobStoreLayout {
    pub master_dir: PathBuf,
    pub completed_dir: PathBuf,
    pub local_dir: PathBuf,
    pub source_dir: Option<PathBuf>,
}

/// A claim on a master job held by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub code: String,
    pub owner: String,
    pub acquired_at: Timestamp,
}

/// Filesystem job backlog.
#[derive(Debug, Clone)]
pub struct JobStore {
    layout: JobStoreLayout,
    channel: Option<String>,
}

impl JobStore {
    pub fn new(layout: JobStoreLayout) -> Self {
        Self {
            layout,
            channel: None,
        }
    }

    /// Restrict scans to codes of one channel.
    pub fn with_channel(mut self, channel: Option<String>) -> Self {
        self.channel = channel;
        self
    }

    pub fn layout(&self) -> &JobStoreLayout {
        &self.layout
    }

    pub fn master_path(&self, code: &str) -> PathBuf {
        self.layout.master_dir.join(code)
    }

    pub fn completed_path(&self, code: &str) -> PathBuf {
        self.layout.completed_dir.join(code)
    }

    pub fn local_path(&self, code: &str) -> PathBuf {
        self.layout.local_dir.join(code)
    }

    // ---- queries ----

    /// Whether the job has already been published to the completed share.
    pub async fn is_complete_on_master(&self, code: &str) -> bool {
        dir_has_entries(&self.completed_path(code)).await
    }

    /// Whether `job_dir` holds a parseable manifest with at least one prompt.
    pub async fn has_manifest_with_content(&self, job_dir: &Path, code: &str) -> bool {
        let repo = JsonManifestRepo::for_job(job_dir, code);
        match repo.read().await {
            Ok(manifest) => manifest.has_content(),
            Err(e) => {
                if repo.exists().await {
                    tracing::warn!(code, error = %e, "Manifest unreadable");
                }
                false
            }
        }
    }

    /// Number of artifact files in `<job_dir>/img`.
    pub async fn count_artifacts(&self, job_dir: &Path) -> usize {
        let img_dir = job_dir.join(ARTIFACT_DIR);
        let Ok(mut entries) = tokio::fs::read_dir(&img_dir).await else {
            return 0;
        };
        let mut count = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if is_artifact_file(&entry.file_name().to_string_lossy()) {
                count += 1;
            }
        }
        count
    }

    /// Completeness of the local working copy, if it has a manifest.
    pub async fn local_completion(&self, code: &str) -> Option<CompletionReport> {
        let dir = self.local_path(code);
        let manifest = JsonManifestRepo::for_job(&dir, code).read().await.ok()?;
        let found = self.count_artifacts(&dir).await;
        Some(evaluate(&manifest, found))
    }

    // ---- scanning ----

    /// Codes with work left: unfinished local copies first, then the
    /// master backlog. Each group is sorted; duplicates keep their first
    /// position.
    pub async fn scan_pending(&self) -> Result<Vec<String>, StoreError> {
        let mut pending = Vec::new();

        for code in self.list_codes(&self.layout.local_dir).await? {
            if self.is_complete_on_master(&code).await {
                continue;
            }
            let local = self.local_path(&code);
            if !self.has_manifest_with_content(&local, &code).await {
                continue;
            }
            if self
                .local_completion(&code)
                .await
                .is_some_and(|r| r.is_complete())
            {
                continue;
            }
            tracing::debug!(code = %code, "Incomplete local job");
            pending.push(code);
        }

        for code in self.list_codes(&self.layout.master_dir).await? {
            if pending.contains(&code) || self.is_complete_on_master(&code).await {
                continue;
            }
            if self
                .has_manifest_with_content(&self.master_path(&code), &code)
                .await
            {
                tracing::debug!(code = %code, "Pending master job");
                pending.push(code);
            }
        }

        Ok(pending)
    }

    /// Sorted directory names under `root` that are valid codes of our channel.
    async fn list_codes(&self, root: &Path) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(root, e)),
        };

        let mut codes = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(root, e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_project_code(&name).is_ok()
                && matches_channel(&name, self.channel.as_deref())
            {
                codes.push(name);
            }
        }
        codes.sort();
        Ok(codes)
    }

    // ---- claim / publish / cleanup ----

    /// Make a local working copy of `code`.
    ///
    /// An existing local copy with a manifest is reused so interrupted
    /// jobs resume where they stopped. Returns `None` if the job is not in
    /// the backlog.
    pub async fn claim_local(&self, code: &str) -> Result<Option<PathBuf>, StoreError> {
        validate_project_code(code)?;
        let local = self.local_path(code);

        if JsonManifestRepo::for_job(&local, code).exists().await {
            tracing::info!(code, path = %local.display(), "Resuming local working copy");
            return Ok(Some(local));
        }

        let master = self.master_path(code);
        if !tokio::fs::try_exists(&master).await.unwrap_or(false) {
            tracing::warn!(code, "Job not found in master backlog");
            return Ok(None);
        }

        let copied = copy_dir(&master, &local).await?;
        tracing::info!(code, files = copied, path = %local.display(), "Copied job from master");
        Ok(Some(local))
    }

    /// Copy the local working copy to the completed share.
    pub async fn publish(&self, code: &str) -> Result<PathBuf, StoreError> {
        validate_project_code(code)?;
        let target = self.completed_path(code);
        let copied = copy_dir(&self.local_path(code), &target).await?;
        tracing::info!(code, files = copied, path = %target.display(), "Published job");
        Ok(target)
    }

    /// Remove the local working copy.
    pub async fn delete_local(&self, code: &str) -> Result<(), StoreError> {
        validate_project_code(code)?;
        let local = self.local_path(code);
        match tokio::fs::remove_dir_all(&local).await {
            Ok(()) => {
                tracing::info!(code, "Deleted local working copy");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&local, e)),
        }
    }

    /// Remove the raw inputs of `code` from the source share.
    ///
    /// Deletes every entry of `<source>/<channel>/` named after the code
    /// (see [`names_code`]), `<source>/<code>.txt`, and the code's channel
    /// folder once it is empty. Individual failures are logged, not
    /// returned. Returns the number of entries removed.
    pub async fn cleanup_source(&self, code: &str) -> Result<usize, StoreError> {
        validate_project_code(code)?;
        let Some(source_dir) = &self.layout.source_dir else {
            return Ok(0);
        };

        let mut removed = 0;

        if let Some(channel) = channel_of(code) {
            let channel_dir = source_dir.join(channel);
            if let Ok(mut entries) = tokio::fs::read_dir(&channel_dir).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    if !names_code(&entry.file_name().to_string_lossy(), code) {
                        continue;
                    }
                    let path = entry.path();
                    match remove_any(&path).await {
                        Ok(()) => {
                            tracing::info!(code, path = %path.display(), "Removed source entry");
                            removed += 1;
                        }
                        Err(e) => {
                            tracing::warn!(code, path = %path.display(), error = %e, "Cannot remove source entry");
                        }
                    }
                }
                if !dir_has_entries(&channel_dir).await {
                    if let Err(e) = tokio::fs::remove_dir(&channel_dir).await {
                        tracing::warn!(path = %channel_dir.display(), error = %e, "Cannot remove empty channel folder");
                    }
                }
            }
        }

        let transcript = source_dir.join(format!("{code}.txt"));
        if tokio::fs::remove_file(&transcript).await.is_ok() {
            removed += 1;
        }

        Ok(removed)
    }

    // ---- leases ----

    /// Try to claim the master copy of `code` for `owner`.
    ///
    /// Uses create-new semantics on `<master>/<code>/.lease`. A lease held
    /// by `owner` is renewed; a lease older than `ttl` is taken over.
    /// Returns `None` while another worker holds a fresh lease.
    pub async fn try_acquire_lease(
        &self,
        code: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        validate_project_code(code)?;
        let path = self.master_path(code).join(LEASE_FILE_NAME);

        for _ in 0..2 {
            let lease = Lease {
                code: code.to_string(),
                owner: owner.to_string(),
                acquired_at: Utc::now(),
            };
            match create_new_json(&path, &lease).await {
                Ok(()) => {
                    tracing::info!(code, owner, "Lease acquired");
                    return Ok(Some(lease));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(StoreError::io(&path, e)),
            }

            let existing = read_lease(&path).await;
            let reclaim = match &existing {
                Some(held) if held.owner == owner => true,
                Some(held) => lease_age(held) > ttl,
                None => true,
            };
            if !reclaim {
                if let Some(held) = existing {
                    tracing::info!(code, holder = %held.owner, "Job leased by another worker");
                }
                return Ok(None);
            }
            tracing::warn!(code, owner, "Replacing stale or own lease");
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }

        Ok(None)
    }

    /// Release a lease if it is still ours.
    pub async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let path = self.master_path(&lease.code).join(LEASE_FILE_NAME);
        match read_lease(&path).await {
            Some(held) if held.owner == lease.owner => match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::info!(code = %lease.code, "Lease released");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StoreError::io(&path, e)),
            },
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn dir_has_entries(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

async fn remove_any(path: &Path) -> std::io::Result<()> {
    if tokio::fs::metadata(path).await?.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

/// Recursively copy `from` into `to`, skipping lease files. Returns the
/// number of files copied.
async fn copy_dir(from: &Path, to: &Path) -> Result<usize, StoreError> {
    let mut copied = 0;
    let mut stack = vec![(from.to_path_buf(), to.to_path_buf())];

    while let Some((src, dst)) = stack.pop() {
        tokio::fs::create_dir_all(&dst)
            .await
            .map_err(|e| StoreError::io(&dst, e))?;
        let mut entries = tokio::fs::read_dir(&src)
            .await
            .map_err(|e| StoreError::io(&src, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&src, e))?
        {
            let name = entry.file_name();
            if name == LEASE_FILE_NAME {
                continue;
            }
            let src_path = entry.path();
            let dst_path = dst.join(&name);
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StoreError::io(&src_path, e))?;
            if file_type.is_dir() {
                stack.push((src_path, dst_path));
            } else {
                tokio::fs::copy(&src_path, &dst_path)
                    .await
                    .map_err(|e| StoreError::io(&dst_path, e))?;
                copied += 1;
            }
        }
    }

    Ok(copied)
}

async fn create_new_json(path: &Path, lease: &Lease) -> std::io::Result<()> {
    let json = serde_json::to_vec(lease).map_err(std::io::Error::other)?;
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(&json).await?;
    file.sync_all().await
}

async fn read_lease(path: &Path) -> Option<Lease> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn lease_age(lease: &Lease) -> Duration {
    (Utc::now() - lease.acquired_at)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
