//! The agent capability seam.
//!
//! An [`Agent`] drives one isolated browser session against the target
//! content-generation service. Everything the coordination layer knows
//! about that session goes through this trait; the selector/DOM work
//! lives behind it.
//!
//! Failures cross the boundary as a structured [`AgentFailure`] whose
//! [`FailureKind`] is decided by the implementation, never re-derived
//! downstream from message text.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// Classification of a failed agent call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The target rejected the prompt or a reference for content-policy
    /// reasons. Recoverable through the validate-and-fix workflow.
    PolicyViolation,
    /// The session is no longer authorised (logged out, 401/403).
    Unauthorized,
    /// Anything else: timeouts, network blips, crashed browser.
    Transient,
}

impl FailureKind {
    /// Wire / manifest representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::PolicyViolation => "policy_violation",
            FailureKind::Unauthorized => "unauthorized",
            FailureKind::Transient => "transient",
        }
    }

    /// Parse an error class reported by an agent implementation.
    ///
    /// Unknown or missing classes are treated as `Transient`.
    pub fn from_class(class: Option<&str>) -> Self {
        match class {
            Some("policy_violation") => FailureKind::PolicyViolation,
            Some("unauthorized") => FailureKind::Unauthorized,
            _ => FailureKind::Transient,
        }
    }

    /// Whether failures of this kind count towards the restart threshold.
    ///
    /// Policy violations are expected content outcomes, not agent faults.
    pub fn counts_against_health(&self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed agent call, already classified at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AgentFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl AgentFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn policy_violation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::PolicyViolation, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unauthorized, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }
}

// ---------------------------------------------------------------------------
// Requests and artifacts
// ---------------------------------------------------------------------------

/// A previously generated artifact used as an input to a new generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Opaque media handle issued by the target service.
    pub handle: String,
}

impl ArtifactRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
        }
    }
}

/// One generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub references: Vec<ArtifactRef>,
    /// Where the agent should save the produced file, if anywhere.
    /// Validation probes leave this empty.
    pub output_path: Option<PathBuf>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            references: Vec::new(),
            output_path: None,
        }
    }

    pub fn with_references(mut self, references: Vec<ArtifactRef>) -> Self {
        self.references = references;
        self
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}

/// A successfully generated artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub handle: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Agent trait
// ---------------------------------------------------------------------------

/// Opaque automation unit controlling one browser session.
///
/// Implementations use interior mutability; every method takes `&self`
/// so one agent can be shared between its worker task and the health
/// supervisor via `Arc<dyn Agent>`.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Open the session, optionally re-entering `session_url`.
    async fn setup(&self, session_url: Option<&str>) -> Result<(), AgentFailure>;

    /// Produce one artifact for `request`.
    async fn generate_artifact(
        &self,
        request: GenerationRequest,
    ) -> Result<Vec<Artifact>, AgentFailure>;

    /// Select a generation mode on the target (e.g. `"image"`).
    async fn switch_mode(&self, mode: &str) -> Result<(), AgentFailure>;

    /// Release the session. Must not fail; implementations log and move on.
    async fn close(&self);

    /// Whether the target currently shows a signed-out session.
    async fn is_logged_out(&self) -> bool;

    /// Sign the session back in.
    async fn reauthenticate(&self) -> Result<(), AgentFailure>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
