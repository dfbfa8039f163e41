//! Validate-and-fix workflow for reference artifacts.
//!
//! Per reference id:
//!
//! ```text
//! untested ─test─▶ verified
//!     │
//!     ├─policy─▶ violated ─▶ fixing ─rewrite─▶ regenerating ─▶ retesting ─▶ verified_fixed
//!     │             ▲           │                  │                │
//!     │             └─ rewrite/regenerate failed ──┘                └─▶ violated_unfixable
//!     └─other─▶ error_<kind>
//! ```
//!
//! Every persisted status is written through [`ManifestStore::write_item`]
//! before the next step starts, so a run interrupted at any point resumes
//! by calling [`ReferenceValidator::validate_and_fix`] again. The next
//! action is derived only from the persisted status: an item in `fixing`
//! continues exactly like one in `violated`, its old handle already
//! cleared.
//!
//! `testing`, `regenerating` and `retesting` are not persisted; they are
//! logged and published on the event bus.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reelforge_core::agent::{Agent, ArtifactRef, FailureKind, GenerationRequest};
use reelforge_core::error::CoreError;
use reelforge_core::manifest::{ItemUpdate, ManifestStore};
use reelforge_core::naming::{image_file_name, ARTIFACT_DIR};
use reelforge_core::validation_status::{RoleHint, ValidationStatus};
use reelforge_events::{EventBus, FleetEvent, FleetEventKind};
use serde::Serialize;

use crate::rewrite::Rewriter;

/// Pause between items of a batch.
pub const DEFAULT_ITEM_DELAY: Duration = Duration::from_secs(3);

/// Pause between regenerating and retesting.
pub const DEFAULT_RETEST_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Step at which a fix attempt gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStage {
    Rewrite,
    Regenerate,
    Retest,
}

/// Result of one [`ReferenceValidator::validate_and_fix`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Passed with its current prompt and handle.
    Verified,
    /// Repaired: new prompt and handle persisted as `verified_fixed`.
    Fixed { prompt: String, handle: String },
    /// Nothing to test yet (no handle).
    Skipped,
    /// Already in a final state; left untouched.
    Settled(ValidationStatus),
    /// The test failed for a non-policy reason.
    Errored(FailureKind),
    /// A violation could not be repaired in this pass.
    Unfixed(FixStage),
    /// The id is not in the manifest.
    Missing,
}

impl ItemOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ItemOutcome::Errored(_) | ItemOutcome::Unfixed(_) | ItemOutcome::Missing
        )
    }
}

/// Batch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationStats {
    /// Items that were tested or entered the fix path.
    pub tested: usize,
    pub verified: usize,
    /// Items found violating (fresh or resumed).
    pub violated: usize,
    pub fixed: usize,
    pub failed: usize,
}

impl ValidationStats {
    fn record(&mut self, outcome: &ItemOutcome, entered_fix: bool) {
        let examined = !matches!(outcome, ItemOutcome::Skipped | ItemOutcome::Settled(_));
        if examined {
            self.tested += 1;
        }
        if entered_fix {
            self.violated += 1;
        }
        match outcome {
            ItemOutcome::Verified => self.verified += 1,
            ItemOutcome::Fixed { .. } => self.fixed += 1,
            o if o.is_failure() => self.failed += 1,
            _ => {}
        }
    }
}

/// Delays used by the workflow.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub item_delay: Duration,
    pub retest_delay: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            item_delay: DEFAULT_ITEM_DELAY,
            retest_delay: DEFAULT_RETEST_DELAY,
        }
    }
}

// ---------------------------------------------------------------------------
// ReferenceValidator
// ---------------------------------------------------------------------------

/// Runs the validate-and-fix state machine against one job's manifest.
///
/// The agent must already be set up inside the job's session so that
/// regenerated artifacts land in the same project.
pub struct ReferenceValidator {
    store: Arc<dyn ManifestStore>,
    agent: Arc<dyn Agent>,
    rewriter: Arc<dyn Rewriter>,
    config: ValidatorConfig,
    /// Job directory; regenerated files go to `<job_dir>/img/<id>.png`.
    job_dir: Option<PathBuf>,
    code: Option<String>,
    events: Option<Arc<EventBus>>,
}

impl ReferenceValidator {
    pub fn new(
        store: Arc<dyn ManifestStore>,
        agent: Arc<dyn Agent>,
        rewriter: Arc<dyn Rewriter>,
    ) -> Self {
        Self {
            store,
            agent,
            rewriter,
            config: ValidatorConfig::default(),
            job_dir: None,
            code: None,
            events: None,
        }
    }

    pub fn with_config(mut self, config: ValidatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_job(mut self, code: impl Into<String>, job_dir: impl Into<PathBuf>) -> Self {
        self.code = Some(code.into());
        self.job_dir = Some(job_dir.into());
        self
    }

    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Validate every id sequentially with a pause between items.
    ///
    /// Store failures abort only the affected item; they are logged and
    /// counted as failed.
    pub async fn validate_all(&self, ids: &[String]) -> ValidationStats {
        let mut stats = ValidationStats::default();
        tracing::info!(count = ids.len(), code = ?self.code, "Validating references");

        for (i, id) in ids.iter().enumerate() {
            if i > 0 && !self.config.item_delay.is_zero() {
                tokio::time::sleep(self.config.item_delay).await;
            }
            tracing::info!(ref_id = %id, position = i + 1, total = ids.len(), "Validating reference");

            match self.run_item(id).await {
                Ok((outcome, entered_fix)) => {
                    tracing::info!(ref_id = %id, outcome = ?outcome, "Reference validated");
                    stats.record(&outcome, entered_fix);
                }
                Err(e) => {
                    tracing::error!(ref_id = %id, error = %e, "Reference validation aborted");
                    stats.tested += 1;
                    stats.failed += 1;
                }
            }
        }

        tracing::info!(
            tested = stats.tested,
            verified = stats.verified,
            violated = stats.violated,
            fixed = stats.fixed,
            failed = stats.failed,
            "Validation summary"
        );
        stats
    }

    /// Drive one reference to its next resting state.
    pub async fn validate_and_fix(&self, id: &str) -> Result<ItemOutcome, CoreError> {
        self.validate_and_fix_with(id, None).await
    }

    /// Like [`validate_and_fix`](Self::validate_and_fix), but the test
    /// generation uses `test_prompt` instead of the item's own prompt.
    ///
    /// A fix still rewrites the stored prompt, since that is what the
    /// regenerated reference is made from.
    pub async fn validate_and_fix_with(
        &self,
        id: &str,
        test_prompt: Option<&str>,
    ) -> Result<ItemOutcome, CoreError> {
        self.run_item_with(id, test_prompt)
            .await
            .map(|(outcome, _)| outcome)
    }

    /// Returns the outcome and whether the fix path was entered.
    async fn run_item(&self, id: &str) -> Result<(ItemOutcome, bool), CoreError> {
        self.run_item_with(id, None).await
    }

    async fn run_item_with(
        &self,
        id: &str,
        test_prompt: Option<&str>,
    ) -> Result<(ItemOutcome, bool), CoreError> {
        let Some(item) = self.store.read_item(id).await? else {
            tracing::error!(ref_id = id, "Reference not found in manifest");
            return Ok((ItemOutcome::Missing, false));
        };

        match &item.validation {
            ValidationStatus::Verified
            | ValidationStatus::VerifiedFixed
            | ValidationStatus::ViolatedUnfixable => {
                tracing::debug!(ref_id = id, status = %item.validation, "Reference already settled");
                return Ok((ItemOutcome::Settled(item.validation.clone()), false));
            }
            status if status.needs_fix() => {
                tracing::info!(ref_id = id, status = %status, "Resuming fix");
                let outcome = self.fix(id, &item.prompt).await?;
                return Ok((outcome, true));
            }
            _ => {}
        }

        if item.media_id.is_empty() {
            tracing::info!(ref_id = id, "Reference has no handle yet, skipping");
            return Ok((ItemOutcome::Skipped, false));
        }

        self.transient(id, "testing");
        let prompt = test_prompt.unwrap_or(&item.prompt);
        match self.probe(id, &item.media_id, prompt).await {
            Ok(()) => {
                self.persist(id, ItemUpdate::validation(ValidationStatus::Verified))
                    .await?;
                Ok((ItemOutcome::Verified, false))
            }
            Err(FailureKind::PolicyViolation) => {
                self.persist(id, ItemUpdate::validation(ValidationStatus::Violated))
                    .await?;
                let outcome = self.fix(id, &item.prompt).await?;
                Ok((outcome, true))
            }
            Err(kind) => {
                self.persist(id, ItemUpdate::validation(ValidationStatus::error(kind)))
                    .await?;
                Ok((ItemOutcome::Errored(kind), false))
            }
        }
    }

    /// `violated → fixing → regenerating → retesting → verified_fixed | violated_unfixable`.
    async fn fix(&self, id: &str, original_prompt: &str) -> Result<ItemOutcome, CoreError> {
        // The old handle is dropped before anything else happens.
        self.persist(
            id,
            ItemUpdate::validation(ValidationStatus::Fixing).with_media_id(""),
        )
        .await?;

        let role = RoleHint::from_ref_id(id);
        let Some(new_prompt) = self.rewriter.rewrite(original_prompt, role).await else {
            tracing::warn!(ref_id = id, role = role.as_str(), "Rewrite failed");
            self.persist(id, ItemUpdate::validation(ValidationStatus::Violated))
                .await?;
            return Ok(ItemOutcome::Unfixed(FixStage::Rewrite));
        };

        self.transient(id, "regenerating");
        let Some(candidate) = self.regenerate(id, &new_prompt).await else {
            self.persist(id, ItemUpdate::validation(ValidationStatus::Violated))
                .await?;
            return Ok(ItemOutcome::Unfixed(FixStage::Regenerate));
        };

        if !self.config.retest_delay.is_zero() {
            tokio::time::sleep(self.config.retest_delay).await;
        }

        self.transient(id, "retesting");
        match self.probe(id, &candidate, &new_prompt).await {
            Ok(()) => {
                self.persist(
                    id,
                    ItemUpdate::validation(ValidationStatus::VerifiedFixed)
                        .with_prompt(new_prompt.clone())
                        .with_media_id(candidate.clone()),
                )
                .await?;
                tracing::info!(ref_id = id, "Reference fixed");
                Ok(ItemOutcome::Fixed {
                    prompt: new_prompt,
                    handle: candidate,
                })
            }
            Err(kind) => {
                tracing::warn!(ref_id = id, kind = %kind, "Retest failed, reference unfixable");
                self.persist(id, ItemUpdate::validation(ValidationStatus::ViolatedUnfixable))
                    .await?;
                Ok(ItemOutcome::Unfixed(FixStage::Retest))
            }
        }
    }

    /// Exercise `handle` as a reference input with `prompt`.
    async fn probe(&self, id: &str, handle: &str, prompt: &str) -> Result<(), FailureKind> {
        let request =
            GenerationRequest::new(prompt).with_references(vec![ArtifactRef::new(handle)]);
        match self.agent.generate_artifact(request).await {
            Ok(_) => {
                tracing::info!(ref_id = id, "Reference test passed");
                Ok(())
            }
            Err(failure) => {
                tracing::info!(ref_id = id, kind = %failure.kind, message = %failure.message, "Reference test failed");
                Err(failure.kind)
            }
        }
    }

    /// Generate a fresh artifact in the current session. Returns its handle.
    async fn regenerate(&self, id: &str, prompt: &str) -> Option<String> {
        let mut request = GenerationRequest::new(prompt);
        if let Some(dir) = &self.job_dir {
            request = request.with_output(dir.join(ARTIFACT_DIR).join(image_file_name(id)));
        }
        match self.agent.generate_artifact(request).await {
            Ok(artifacts) => {
                let handle = artifacts
                    .into_iter()
                    .map(|a| a.handle)
                    .find(|h| !h.is_empty());
                if handle.is_none() {
                    tracing::warn!(ref_id = id, "Regeneration returned no handle");
                }
                handle
            }
            Err(failure) => {
                tracing::warn!(ref_id = id, error = %failure, "Regeneration failed");
                None
            }
        }
    }

    async fn persist(&self, id: &str, update: ItemUpdate) -> Result<(), CoreError> {
        let status = update.validation.clone();
        self.store.write_item(id, update).await?;
        if let Some(status) = status {
            tracing::info!(ref_id = id, status = %status, "Reference status persisted");
            self.publish(id, serde_json::json!({ "status": status.as_string() }));
        }
        Ok(())
    }

    fn transient(&self, id: &str, stage: &str) {
        tracing::info!(ref_id = id, stage, "Reference workflow step");
        self.publish(id, serde_json::json!({ "stage": stage }));
    }

    fn publish(&self, id: &str, payload: serde_json::Value) {
        let Some(bus) = &self.events else {
            return;
        };
        let mut event = FleetEvent::new(FleetEventKind::WorkflowStatus)
            .with_item(id)
            .with_payload(payload);
        if let Some(code) = &self.code {
            event = event.with_code(code.clone());
        }
        bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_count_by_outcome() {
        let mut stats = ValidationStats::default();
        stats.record(&ItemOutcome::Verified, false);
        stats.record(
            &ItemOutcome::Fixed {
                prompt: "p".into(),
                handle: "h".into(),
            },
            true,
        );
        stats.record(&ItemOutcome::Unfixed(FixStage::Retest), true);
        stats.record(&ItemOutcome::Skipped, false);
        stats.record(&ItemOutcome::Settled(ValidationStatus::VerifiedFixed), false);
        stats.record(&ItemOutcome::Errored(FailureKind::Unauthorized), false);

        assert_eq!(
            stats,
            ValidationStats {
                tested: 4,
                verified: 1,
                violated: 2,
                fixed: 1,
                failed: 2,
            }
        );
    }

    #[test]
    fn failure_outcomes() {
        assert!(ItemOutcome::Missing.is_failure());
        assert!(ItemOutcome::Unfixed(FixStage::Rewrite).is_failure());
        assert!(!ItemOutcome::Skipped.is_failure());
        assert!(!ItemOutcome::Verified.is_failure());
    }
}
