//! Job manifest model and the persistence seam.
//!
//! A manifest lists every sub-task of a job: reference artifacts
//! (characters `nv*`, locations `loc*`) and per-scene artifacts. The
//! manifest is the single source of truth for resumption, so every
//! mutation goes through [`ManifestStore::write_item`], which must be
//! durable before it returns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::partition::SubtaskCategory;
use crate::validation_status::ValidationStatus;

// ---------------------------------------------------------------------------
// SubtaskStatus
// ---------------------------------------------------------------------------

/// Generation status of a sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    Done,
    Skip,
    Error,
}

// ---------------------------------------------------------------------------
// Subtask
// ---------------------------------------------------------------------------

/// One unit of generation work inside a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub status: SubtaskStatus,
    /// Handle of the generated artifact; empty until generated.
    #[serde(default)]
    pub media_id: String,
    #[serde(default)]
    pub validation: ValidationStatus,
    /// Reference ids this sub-task is generated against (scenes only).
    #[serde(default)]
    pub references: Vec<String>,
}

impl Subtask {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            status: SubtaskStatus::Pending,
            media_id: String::new(),
            validation: ValidationStatus::Untested,
            references: Vec::new(),
        }
    }

    pub fn category(&self) -> SubtaskCategory {
        SubtaskCategory::from_id(&self.id)
    }

    pub fn has_prompt(&self) -> bool {
        !self.prompt.trim().is_empty()
    }

    /// Still needs an artifact generated.
    pub fn is_pending(&self) -> bool {
        self.has_prompt() && self.status == SubtaskStatus::Pending
    }

    pub fn record(&self) -> ItemRecord {
        ItemRecord {
            prompt: self.prompt.clone(),
            media_id: self.media_id.clone(),
            validation: self.validation.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Structured record of a job's sub-tasks and reference artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Project code, e.g. `AR47-0028`.
    pub code: String,
    /// Target-session URL used to resume the job's session.
    #[serde(default)]
    pub session_url: Option<String>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
}

impl Manifest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            session_url: None,
            subtasks: Vec::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    /// Ids of character and location references, in manifest order.
    pub fn reference_ids(&self) -> Vec<String> {
        self.subtasks
            .iter()
            .filter(|s| s.category().is_reference())
            .map(|s| s.id.clone())
            .collect()
    }

    /// Sub-tasks that still need generating, in manifest order.
    pub fn pending(&self) -> Vec<Subtask> {
        self.subtasks
            .iter()
            .filter(|s| s.is_pending())
            .cloned()
            .collect()
    }

    /// Whether any sub-task carries a prompt.
    pub fn has_content(&self) -> bool {
        self.subtasks.iter().any(Subtask::has_prompt)
    }

    /// Apply `update` to the sub-task `id` in place.
    ///
    /// All fields of the update are applied together so a prompt and
    /// its handle never disagree on disk.
    pub fn apply(&mut self, id: &str, update: &ItemUpdate) -> Result<(), CoreError> {
        let item = self
            .subtasks
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| CoreError::NotFound {
                entity: "subtask",
                id: id.to_string(),
            })?;

        if let Some(prompt) = &update.prompt {
            item.prompt = prompt.clone();
        }
        if let Some(media_id) = &update.media_id {
            item.media_id = media_id.clone();
        }
        if let Some(validation) = &update.validation {
            item.validation = validation.clone();
        }
        if let Some(status) = update.status {
            item.status = status;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Item read/write shapes
// ---------------------------------------------------------------------------

/// Snapshot of one item as the validate-and-fix workflow sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRecord {
    pub prompt: String,
    pub media_id: String,
    pub validation: ValidationStatus,
}

/// Partial update of one item. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemUpdate {
    pub prompt: Option<String>,
    pub media_id: Option<String>,
    pub validation: Option<ValidationStatus>,
    pub status: Option<SubtaskStatus>,
}

impl ItemUpdate {
    pub fn validation(status: ValidationStatus) -> Self {
        Self {
            validation: Some(status),
            ..Default::default()
        }
    }

    pub fn with_media_id(mut self, media_id: impl Into<String>) -> Self {
        self.media_id = Some(media_id.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_status(mut self, status: SubtaskStatus) -> Self {
        self.status = Some(status);
        self
    }
}

// ---------------------------------------------------------------------------
// ManifestStore
// ---------------------------------------------------------------------------

/// Persistence seam for one job's manifest.
///
/// Implementations serialise concurrent writers themselves; two agents
/// of the same job write through one store.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Load the whole manifest.
    async fn load(&self) -> Result<Manifest, CoreError>;

    /// Read one item, or `None` if the id is unknown.
    async fn read_item(&self, id: &str) -> Result<Option<ItemRecord>, CoreError>;

    /// Apply `update` to one item. Durable before returning.
    async fn write_item(&self, id: &str, update: ItemUpdate) -> Result<(), CoreError>;

    /// Reference item ids, in manifest order.
    async fn list_items(&self) -> Result<Vec<String>, CoreError>;
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use super::*;

    fn sample() -> Manifest {
        let mut m = Manifest::new("AR8-0003");
        m.subtasks.push(Subtask::new("nv1", "a sailor"));
        m.subtasks.push(Subtask::new("loc1", "a harbour at dawn"));
        m.subtasks.push(Subtask::new("1", "the sailor walks the pier"));
        m.subtasks.push(Subtask::new("2", ""));
        m
    }

    #[test]
    fn reference_ids_exclude_scenes() {
        assert_eq!(sample().reference_ids(), vec!["nv1", "loc1"]);
    }

    #[test]
    fn pending_skips_empty_prompts_and_finished_items() {
        let mut m = sample();
        m.subtasks[0].status = SubtaskStatus::Done;
        let ids: Vec<_> = m.pending().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["loc1", "1"]);
    }

    #[test]
    fn apply_updates_all_fields_together() {
        let mut m = sample();
        let update = ItemUpdate::validation(ValidationStatus::VerifiedFixed)
            .with_prompt("an empty harbour at dawn")
            .with_media_id("media-9");
        m.apply("loc1", &update).unwrap();

        let item = m.get("loc1").unwrap();
        assert_eq!(item.prompt, "an empty harbour at dawn");
        assert_eq!(item.media_id, "media-9");
        assert_eq!(item.validation, ValidationStatus::VerifiedFixed);
        assert_eq!(item.status, SubtaskStatus::Pending);
    }

    #[test]
    fn apply_unknown_id_is_not_found() {
        let mut m = sample();
        let err = m.apply("loc9", &ItemUpdate::default()).unwrap_err();
        assert_matches!(err, CoreError::NotFound { .. });
    }

    #[test]
    fn manifest_without_prompts_has_no_content() {
        let mut m = Manifest::new("AR8-0004");
        m.subtasks.push(Subtask::new("1", "   "));
        assert!(!m.has_content());
        assert!(sample().has_content());
    }

    #[test]
    fn missing_fields_deserialize_with_defaults() {
        let json = r#"{"code":"AR1-0001","subtasks":[{"id":"loc1","prompt":"a hill"}]}"#;
        let m: Manifest = serde_json::from_str(json).unwrap();
        let item = m.get("loc1").unwrap();
        assert_eq!(item.status, SubtaskStatus::Pending);
        assert_eq!(item.validation, ValidationStatus::Untested);
        assert!(item.media_id.is_empty());
        assert!(m.session_url.is_none());
    }
}
