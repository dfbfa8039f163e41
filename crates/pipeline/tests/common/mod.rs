//! Shared fakes for pipeline integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reelforge_core::agent::{Agent, AgentFailure, Artifact, GenerationRequest};
use reelforge_core::manifest::{Manifest, Subtask};
use reelforge_core::validation_status::{RoleHint, ValidationStatus};
use reelforge_db::JsonManifestRepo;
use reelforge_pipeline::Rewriter;

pub const CODE: &str = "AR9-0042";

// ---------------------------------------------------------------------------
// FakeAgent
// ---------------------------------------------------------------------------

/// Agent whose generation results are scripted in order. Once the script
/// runs out every call succeeds with a fresh `gen-<n>` handle.
#[derive(Default)]
pub struct FakeAgent {
    script: Mutex<VecDeque<Result<Vec<Artifact>, AgentFailure>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    pub logged_out: AtomicBool,
    pub generations: AtomicU32,
    pub setups: AtomicU32,
    pub reauths: AtomicU32,
}

impl FakeAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_ok(&self, handle: &str) {
        self.script.lock().unwrap().push_back(Ok(vec![Artifact {
            handle: handle.to_string(),
            path: None,
        }]));
    }

    pub fn push_err(&self, failure: AgentFailure) {
        self.script.lock().unwrap().push_back(Err(failure));
    }

    pub fn generation_count(&self) -> u32 {
        self.generations.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Prompts of every generation request, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.prompt).collect()
    }
}

#[async_trait]
impl Agent for FakeAgent {
    async fn setup(&self, _session_url: Option<&str>) -> Result<(), AgentFailure> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn generate_artifact(
        &self,
        request: GenerationRequest,
    ) -> Result<Vec<Artifact>, AgentFailure> {
        let n = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request);
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(vec![Artifact {
                handle: format!("gen-{n}"),
                path: None,
            }])
        })
    }

    async fn switch_mode(&self, _mode: &str) -> Result<(), AgentFailure> {
        Ok(())
    }

    async fn close(&self) {}

    async fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    async fn reauthenticate(&self) -> Result<(), AgentFailure> {
        self.reauths.fetch_add(1, Ordering::SeqCst);
        Err(AgentFailure::unauthorized("credentials rejected"))
    }
}

// ---------------------------------------------------------------------------
// FakeRewriter
// ---------------------------------------------------------------------------

/// Rewriter that returns a fixed prompt, or fails when `reply` is `None`.
pub struct FakeRewriter {
    reply: Option<String>,
    pub calls: Mutex<Vec<(String, RoleHint)>>,
}

impl FakeRewriter {
    pub fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Rewriter for FakeRewriter {
    async fn rewrite(&self, prompt: &str, role: RoleHint) -> Option<String> {
        self.calls.lock().unwrap().push((prompt.to_string(), role));
        self.reply.clone()
    }
}

// ---------------------------------------------------------------------------
// Manifests
// ---------------------------------------------------------------------------

/// A reference item with a handle and validation status.
pub fn reference(id: &str, prompt: &str, media_id: &str, validation: ValidationStatus) -> Subtask {
    let mut s = Subtask::new(id, prompt);
    s.media_id = media_id.to_string();
    s.validation = validation;
    s
}

/// Write `subtasks` as the manifest of [`CODE`] in `dir`.
pub async fn seed_manifest(dir: &Path, subtasks: Vec<Subtask>) -> Arc<JsonManifestRepo> {
    let mut manifest = Manifest::new(CODE);
    manifest.session_url = Some("https://example.test/project/p42".into());
    manifest.subtasks = subtasks;
    let repo = JsonManifestRepo::for_job(dir, CODE);
    repo.save(&manifest).await.unwrap();
    Arc::new(repo)
}
