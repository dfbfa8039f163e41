//! JSON-file manifest repository.
//!
//! Every write replaces the whole document atomically: the new content
//! is written to a sibling temp file, fsynced, then renamed over the
//! original, and the directory is fsynced after the rename. A crash
//! therefore leaves either the old or the new manifest on disk, never a
//! torn one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reelforge_core::error::CoreError;
use reelforge_core::manifest::{ItemRecord, ItemUpdate, Manifest, ManifestStore};
use reelforge_core::naming::manifest_file_name;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::StoreError;

/// Manifest stored as `<job_dir>/<code>_manifest.json`.
///
/// Writers inside one process are serialised by an internal lock so two
/// agents of the same job never interleave read-modify-write cycles.
pub struct JsonManifestRepo {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonManifestRepo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// The manifest of job `code` inside `job_dir`.
    pub fn for_job(job_dir: &Path, code: &str) -> Self {
        Self::new(job_dir.join(manifest_file_name(code)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Read and parse the manifest.
    pub async fn read(&self) -> Result<Manifest, StoreError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Replace the manifest on disk. Durable when this returns.
    pub async fn save(&self, manifest: &Manifest) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_atomic(manifest).await
    }

    async fn write_atomic(&self, manifest: &Manifest) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(manifest).map_err(|source| StoreError::Json {
            path: self.path.display().to_string(),
            source,
        })?;

        let tmp_path = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        file.write_all(&json)
            .await
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(StoreError::io(&self.path, e));
        }
        self.sync_parent().await
    }

    /// Flush the directory entry so the rename itself survives a crash.
    #[cfg(unix)]
    async fn sync_parent(&self) -> Result<(), StoreError> {
        let Some(parent) = self.path.parent() else {
            return Ok(());
        };
        let dir = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        tokio::fs::File::open(dir)
            .await
            .map_err(|e| StoreError::io(dir, e))?
            .sync_all()
            .await
            .map_err(|e| StoreError::io(dir, e))
    }

    #[cfg(not(unix))]
    async fn sync_parent(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "manifest.json".to_string());
        self.path
            .with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
    }
}

#[async_trait]
impl ManifestStore for JsonManifestRepo {
    async fn load(&self) -> Result<Manifest, CoreError> {
        Ok(self.read().await?)
    }

    async fn read_item(&self, id: &str) -> Result<Option<ItemRecord>, CoreError> {
        let manifest = self.read().await?;
        Ok(manifest.get(id).map(|s| s.record()))
    }

    async fn write_item(&self, id: &str, update: ItemUpdate) -> Result<(), CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut manifest = self.read().await?;
        manifest.apply(id, &update)?;
        self.write_atomic(&manifest).await?;
        tracing::debug!(path = %self.path.display(), item = id, "Manifest item persisted");
        Ok(())
    }

    async fn list_items(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.read().await?.reference_ids())
    }
}
