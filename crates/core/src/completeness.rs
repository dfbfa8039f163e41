//! Job completeness rule.
//!
//! A job is complete when every sub-task that carries a prompt is `done`
//! and at least that many artifact files exist. Sub-tasks marked `skip`
//! are excluded from the expectation.

use serde::Serialize;

use crate::manifest::{Manifest, SubtaskStatus};

/// Outcome of a completeness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletionReport {
    /// Sub-tasks with a prompt that are not skipped.
    pub expected: usize,
    /// Of those, how many are `done`.
    pub done: usize,
    /// Artifact files present on disk.
    pub artifacts_found: usize,
}

impl CompletionReport {
    pub fn is_complete(&self) -> bool {
        self.done == self.expected && self.artifacts_found >= self.expected
    }

    pub fn remaining(&self) -> usize {
        self.expected.saturating_sub(self.done)
    }
}

/// Evaluate `manifest` against the number of artifact files found.
pub fn evaluate(manifest: &Manifest, artifacts_found: usize) -> CompletionReport {
    let counted = manifest
        .subtasks
        .iter()
        .filter(|s| s.has_prompt() && s.status != SubtaskStatus::Skip);

    let (expected, done) = counted.fold((0, 0), |(expected, done), s| {
        let done = done + usize::from(s.status == SubtaskStatus::Done);
        (expected + 1, done)
    });

    CompletionReport {
        expected,
        done,
        artifacts_found,
    }
}
