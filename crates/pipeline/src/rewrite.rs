//! Prompt rewriting service.
//!
//! [`Rewriter`] is the seam the validate-and-fix workflow calls when a
//! reference prompt was rejected on policy grounds. [`ChatRewriter`] is
//! the production implementation: an OpenAI-compatible chat-completions
//! client (DeepSeek by default) using [`reqwest`].

use std::time::Duration;

use async_trait::async_trait;
use reelforge_core::validation_status::RoleHint;
use serde::{Deserialize, Serialize};

/// Default chat-completions endpoint.
pub const DEFAULT_REWRITE_URL: &str = "https://api.deepseek.com/chat/completions";

/// Default model name.
pub const DEFAULT_REWRITE_MODEL: &str = "deepseek-chat";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const TEMPERATURE: f32 = 0.7;
const MAX_TOKENS: u32 = 500;

const CHARACTER_RULES: &str = "You rewrite image-generation prompts that were rejected by a \
content filter. The subject is a character reference. Keep the character's look, clothing, \
setting and style, but make the subject clearly an adult, remove anything suggestive or \
violent, and avoid naming real people. Reply with the rewritten prompt only.";

const LOCATION_RULES: &str = "You rewrite image-generation prompts that were rejected by a \
content filter. The subject is a location reference. Keep the place, architecture, lighting \
and style, but remove every person, body part and crowd so the scene is empty of people. \
Reply with the rewritten prompt only.";

// ---------------------------------------------------------------------------
// Rewriter trait
// ---------------------------------------------------------------------------

/// Pure function `rewrite(prompt, role) -> new prompt`.
///
/// `None` means the rewrite failed; implementations log the reason.
#[async_trait]
pub trait Rewriter: Send + Sync {
    async fn rewrite(&self, prompt: &str, role: RoleHint) -> Option<String>;
}

/// Rewriter used when no service is configured. Every rewrite fails.
pub struct DisabledRewriter;

#[async_trait]
impl Rewriter for DisabledRewriter {
    async fn rewrite(&self, _prompt: &str, role: RoleHint) -> Option<String> {
        tracing::error!(role = role.as_str(), "Rewrite requested but no rewriting service is configured");
        None
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the chat-completions client.
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    /// Network, DNS, TLS or decode failure.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-2xx response.
    #[error("Rewrite API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The response carried no usable text.
    #[error("Rewrite API returned an empty completion")]
    Empty,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// System instruction for a role.
fn rules_for(role: RoleHint) -> &'static str {
    match role {
        RoleHint::Character => CHARACTER_RULES,
        RoleHint::Location => LOCATION_RULES,
    }
}

/// First non-empty completion, with wrapping quotes removed.
fn first_completion(response: ChatResponse) -> Option<String> {
    let text = response.choices.into_iter().next()?.message.content?;
    let cleaned = text.trim().trim_matches('"').trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

// ---------------------------------------------------------------------------
// ChatRewriter
// ---------------------------------------------------------------------------

/// OpenAI-compatible chat-completions rewriter.
pub struct ChatRewriter {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl ChatRewriter {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self::with_client(client, url, api_key, model)
    }

    /// Reuse an existing [`reqwest::Client`].
    pub fn with_client(
        client: reqwest::Client,
        url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Ask the service for a rewrite.
    pub async fn try_rewrite(&self, prompt: &str, role: RoleHint) -> Result<String, RewriteError> {
        let user = format!("Rewrite this prompt:\n{prompt}");
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: rules_for(role),
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(RewriteError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        first_completion(parsed).ok_or(RewriteError::Empty)
    }
}

#[async_trait]
impl Rewriter for ChatRewriter {
    async fn rewrite(&self, prompt: &str, role: RoleHint) -> Option<String> {
        match self.try_rewrite(prompt, role).await {
            Ok(text) => {
                tracing::debug!(role = role.as_str(), "Prompt rewritten");
                Some(text)
            }
            Err(e) => {
                tracing::error!(role = role.as_str(), error = %e, "Prompt rewrite failed");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn role_selects_rules() {
        assert!(rules_for(RoleHint::Location).contains("remove every person"));
        assert!(rules_for(RoleHint::Character).contains("adult"));
    }

    #[test]
    fn completion_is_trimmed_and_unquoted() {
        let response: ChatResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": "  \"an empty harbour at dawn\"\n"}}]
        }))
        .unwrap();
        assert_eq!(
            first_completion(response).as_deref(),
            Some("an empty harbour at dawn")
        );
    }

    #[test]
    fn blank_completion_is_none() {
        let response: ChatResponse =
            serde_json::from_value(serde_json::json!({"choices": [{"message": {"content": "  "}}]}))
                .unwrap();
        assert!(first_completion(response).is_none());
        let empty: ChatResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(first_completion(empty).is_none());
    }

    #[tokio::test]
    async fn rewrite_posts_chat_request_and_returns_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(bearer_token("test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": DEFAULT_REWRITE_MODEL,
                "max_tokens": MAX_TOKENS
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "a quiet street, no people"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/chat/completions", server.uri());
        let rewriter = ChatRewriter::new(url, "test-key", DEFAULT_REWRITE_MODEL);

        let out = rewriter.rewrite("a busy street", RoleHint::Location).await;
        assert_eq!(out.as_deref(), Some("a quiet street, no people"));
    }

    #[tokio::test]
    async fn api_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(serde_json::json!({"error": "bad key"})),
            )
            .mount(&server)
            .await;
        let url = format!("{}/chat/completions", server.uri());
        let rewriter = ChatRewriter::new(url, "bad", DEFAULT_REWRITE_MODEL);

        let err = rewriter
            .try_rewrite("x", RoleHint::Character)
            .await
            .unwrap_err();
        assert_matches!(err, RewriteError::Api { status: 401, .. });
        assert!(rewriter.rewrite("x", RoleHint::Character).await.is_none());
    }

    #[tokio::test]
    async fn disabled_rewriter_always_fails() {
        assert!(DisabledRewriter
            .rewrite("x", RoleHint::Character)
            .await
            .is_none());
    }
}
