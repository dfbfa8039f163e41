//! [`Agent`] backed by an external browser-driver executable.
//!
//! Every call spawns `<driver> <action>` with a JSON request on stdin and
//! reads one JSON [`DriverResponse`] from stdout. The driver owns the
//! browser session between calls (keyed by the slot id it receives); this
//! side only handles process plumbing, timeouts and error classification.
//!
//! | Action        | Request fields                           |
//! |---------------|------------------------------------------|
//! | `setup`       | `slot`, `session_url`                    |
//! | `generate`    | `slot`, `prompt`, `references`, `output_path` |
//! | `switch_mode` | `slot`, `mode`                           |
//! | `status`      | `slot`                                   |
//! | `reauth`      | `slot`                                   |
//! | `close`       | `slot`                                   |

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reelforge_core::agent::{
    Agent, AgentFailure, Artifact, ArtifactRef, FailureKind, GenerationRequest,
};
use reelforge_core::types::SlotId;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Default per-call timeout.
pub const DEFAULT_DRIVER_TIMEOUT: Duration = Duration::from_secs(600);

/// Stdout/stderr captured per call (1 MiB).
const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;

/// Close gets a short leash; it must never hold up recovery.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Process-level failure talking to the driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Failed to spawn driver: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Driver action '{action}' timed out after {elapsed_ms}ms")]
    Timeout { action: String, elapsed_ms: u64 },

    #[error("Driver action '{action}' exited with {code}: {stderr}")]
    Exit {
        action: String,
        code: i32,
        stderr: String,
    },

    #[error("Driver action '{action}' returned malformed output: {source}")]
    Malformed {
        action: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<DriverError> for AgentFailure {
    fn from(err: DriverError) -> Self {
        AgentFailure::transient(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct DriverRequest<'a> {
    slot: SlotId,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "no_references")]
    references: &'a [ArtifactRef],
    #[serde(skip_serializing_if = "Option::is_none")]
    output_path: Option<&'a std::path::Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<&'a str>,
}

fn no_references(refs: &&[ArtifactRef]) -> bool {
    refs.is_empty()
}

impl<'a> DriverRequest<'a> {
    fn slot(slot: SlotId) -> Self {
        Self {
            slot,
            session_url: None,
            prompt: None,
            references: &[],
            output_path: None,
            mode: None,
        }
    }
}

/// One response line from the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DriverResponse {
    pub ok: bool,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// `policy_violation`, `unauthorized`, or anything else.
    #[serde(default)]
    pub error_class: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub logged_out: bool,
}

impl DriverResponse {
    /// Turn a negative response into a classified failure.
    pub fn into_result(self) -> Result<Vec<Artifact>, AgentFailure> {
        if self.ok {
            return Ok(self.artifacts);
        }
        let kind = FailureKind::from_class(self.error_class.as_deref());
        let message = self
            .message
            .unwrap_or_else(|| "driver reported failure".to_string());
        Err(AgentFailure::new(kind, message))
    }
}

// ---------------------------------------------------------------------------
// ProcessAgent
// ---------------------------------------------------------------------------

/// Agent that shells out to a driver executable for every capability.
pub struct ProcessAgent {
    program: PathBuf,
    args: Vec<String>,
    slot: SlotId,
    timeout: Duration,
}

impl ProcessAgent {
    pub fn new(program: impl Into<PathBuf>, slot: SlotId) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            slot,
            timeout: DEFAULT_DRIVER_TIMEOUT,
        }
    }

    /// Extra arguments placed before the action name.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    async fn call(
        &self,
        action: &str,
        request: &DriverRequest<'_>,
        timeout: Duration,
    ) -> Result<DriverResponse, DriverError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(action)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(DriverError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(request).map_err(|source| DriverError::Malformed {
                action: action.to_string(),
                source,
            })?;
            // The driver may close stdin early; its response decides.
            let _ = stdin.write_all(&payload).await;
            drop(stdin);
        }

        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(DriverError::Spawn(e)),
            Err(_) => {
                return Err(DriverError::Timeout {
                    action: action.to_string(),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                })
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if !status.success() && stdout.trim_ascii().is_empty() {
            return Err(DriverError::Exit {
                action: action.to_string(),
                code: status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        let response: DriverResponse =
            serde_json::from_slice(stdout.trim_ascii()).map_err(|source| DriverError::Malformed {
                action: action.to_string(),
                source,
            })?;

        tracing::debug!(
            slot_id = self.slot,
            action,
            ok = response.ok,
            elapsed_ms,
            "Driver call finished"
        );
        Ok(response)
    }

    async fn run(
        &self,
        action: &str,
        request: &DriverRequest<'_>,
    ) -> Result<Vec<Artifact>, AgentFailure> {
        self.call(action, request, self.timeout).await?.into_result()
    }
}

#[async_trait]
impl Agent for ProcessAgent {
    async fn setup(&self, session_url: Option<&str>) -> Result<(), AgentFailure> {
        let request = DriverRequest {
            session_url,
            ..DriverRequest::slot(self.slot)
        };
        self.run("setup", &request).await.map(|_| ())
    }

    async fn generate_artifact(
        &self,
        request: GenerationRequest,
    ) -> Result<Vec<Artifact>, AgentFailure> {
        let wire = DriverRequest {
            prompt: Some(&request.prompt),
            references: &request.references,
            output_path: request.output_path.as_deref(),
            ..DriverRequest::slot(self.slot)
        };
        self.run("generate", &wire).await
    }

    async fn switch_mode(&self, mode: &str) -> Result<(), AgentFailure> {
        let request = DriverRequest {
            mode: Some(mode),
            ..DriverRequest::slot(self.slot)
        };
        self.run("switch_mode", &request).await.map(|_| ())
    }

    async fn close(&self) {
        let request = DriverRequest::slot(self.slot);
        match self.call("close", &request, CLOSE_TIMEOUT).await {
            Ok(response) if response.ok => {}
            Ok(response) => {
                tracing::warn!(slot_id = self.slot, message = ?response.message, "Driver close reported failure");
            }
            Err(e) => {
                tracing::warn!(slot_id = self.slot, error = %e, "Driver close failed");
            }
        }
    }

    async fn is_logged_out(&self) -> bool {
        match self.call("status", &DriverRequest::slot(self.slot), self.timeout).await {
            Ok(response) => response.logged_out,
            Err(e) => {
                tracing::warn!(slot_id = self.slot, error = %e, "Driver status check failed");
                false
            }
        }
    }

    async fn reauthenticate(&self) -> Result<(), AgentFailure> {
        self.run("reauth", &DriverRequest::slot(self.slot))
            .await
            .map(|_| ())
    }
}

/// Read a stream into memory, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).await;
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn negative_response_is_classified() {
        let response: DriverResponse = serde_json::from_str(
            r#"{"ok": false, "error_class": "policy_violation", "message": "400 blocked"}"#,
        )
        .unwrap();
        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind, FailureKind::PolicyViolation);
        assert_eq!(err.message, "400 blocked");
    }

    #[test]
    fn unknown_class_is_transient() {
        let response = DriverResponse {
            ok: false,
            error_class: Some("weird".into()),
            ..Default::default()
        };
        assert_eq!(response.into_result().unwrap_err().kind, FailureKind::Transient);
    }

    #[test]
    fn positive_response_carries_artifacts() {
        let response: DriverResponse = serde_json::from_str(
            r#"{"ok": true, "artifacts": [{"handle": "m-1", "path": "/tmp/img/1.png"}]}"#,
        )
        .unwrap();
        let artifacts = response.into_result().unwrap();
        assert_eq!(artifacts[0].handle, "m-1");
    }

    #[test]
    fn request_omits_empty_fields() {
        let json = serde_json::to_value(DriverRequest::slot(4)).unwrap();
        assert_eq!(json, serde_json::json!({ "slot": 4 }));
    }

    #[test]
    fn driver_errors_become_transient_failures() {
        let failure: AgentFailure = DriverError::Timeout {
            action: "generate".into(),
            elapsed_ms: 10,
        }
        .into();
        assert_matches!(failure.kind, FailureKind::Transient);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let agent = ProcessAgent::new("/nonexistent/reelforge-driver", 0);
        let err = agent
            .call("status", &DriverRequest::slot(0), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_matches!(err, DriverError::Spawn(_));

        // Capability methods never surface process errors as panics.
        assert!(!agent.is_logged_out().await);
        agent.close().await;
        assert_eq!(agent.setup(None).await.unwrap_err().kind, FailureKind::Transient);
    }

    // -- real driver process ----------------------------------------------------

    #[cfg(unix)]
    const DRIVER_SCRIPT: &str = r#"cat > "$(dirname "$0")/last_request.json"
case "$1" in
  generate) echo '{"ok": true, "artifacts": [{"handle": "m-42"}]}' ;;
  status) echo '{"ok": true, "logged_out": true}' ;;
  reauth) echo '{"ok": false, "error_class": "unauthorized", "message": "login failed"}' ;;
  garbage) echo 'not json' ;;
  crash) echo 'boom' >&2; exit 3 ;;
  slow) sleep 5 ;;
  *) echo '{"ok": true}' ;;
esac
"#;

    /// Runs the script through `/bin/sh` so no exec bit is needed.
    #[cfg(unix)]
    fn script_agent(dir: &std::path::Path) -> ProcessAgent {
        let script = dir.join("driver.sh");
        std::fs::write(&script, DRIVER_SCRIPT).unwrap();
        ProcessAgent::new("/bin/sh", 2).with_args(vec![script.display().to_string()])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn driver_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let agent = script_agent(dir.path());

        agent.setup(Some("https://example.test/project/9")).await.unwrap();
        let sent: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("last_request.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(sent["slot"], 2);
        assert_eq!(sent["session_url"], "https://example.test/project/9");

        let artifacts = agent
            .generate_artifact(
                GenerationRequest::new("a harbour").with_references(vec![ArtifactRef::new("m-1")]),
            )
            .await
            .unwrap();
        assert_eq!(artifacts[0].handle, "m-42");
        let sent: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("last_request.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(sent["prompt"], "a harbour");
        assert_eq!(sent["references"][0]["handle"], "m-1");

        assert!(agent.is_logged_out().await);
        let err = agent.reauthenticate().await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Unauthorized);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn driver_faults_are_typed() {
        let dir = tempfile::tempdir().unwrap();
        let agent = script_agent(dir.path());
        let request = DriverRequest::slot(2);

        assert_matches!(
            agent.call("garbage", &request, Duration::from_secs(5)).await,
            Err(DriverError::Malformed { .. })
        );
        assert_matches!(
            agent.call("crash", &request, Duration::from_secs(5)).await,
            Err(DriverError::Exit { code: 3, ref stderr, .. }) if stderr == "boom"
        );
        assert_matches!(
            agent.call("slow", &request, Duration::from_millis(200)).await,
            Err(DriverError::Timeout { .. })
        );
    }
}
