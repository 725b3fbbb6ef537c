//! Chat-completion transport shared by both model adapters.
//!
//! Speaks the OpenRouter-flavored OpenAI API: bearer auth, optional JSON
//! response mode, optional provider-order routing. Retries are written out
//! explicitly: transient failures (transport, 5xx, malformed envelopes) get
//! up to three attempts with 2 s / 4 s pauses; 4xx responses are permanent
//! and returned immediately.

use sentinel_config::ModelSettings;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Attribution headers OpenRouter asks integrators to send.
const REFERER_HEADER: (&str, &str) = ("HTTP-Referer", "https://github.com/5dlabs/sre-sentinel");
const TITLE_HEADER: (&str, &str) = ("X-Title", "SRE-Sentinel");

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("missing content in model response")]
    MissingContent,
    #[error("malformed model response: {0}")]
    Malformed(String),
}

impl ModelError {
    /// Transient failures are worth another attempt; 4xx answers are not.
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::MissingContent | Self::Malformed(_) => true,
            Self::Status { status, .. } => *status >= 500,
        }
    }
}

/// One chat message on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

/// Per-call tuning for a completion request.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Ask for `response_format = json_object`.
    pub json_mode: bool,
    /// Upstream provider routing order, e.g. `["Cerebras"]` for the fast
    /// classifier.
    pub provider_order: Vec<String>,
}

/// Thin reqwest wrapper over `{base}/chat/completions`.
pub struct ModelClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ModelClient {
    pub fn new(settings: &ModelSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        }
    }

    /// Run a completion, retrying transient failures, and return the
    /// assistant message content.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String, ModelError> {
        let mut attempt = 1;
        loop {
            match self.chat_once(messages, options).await {
                Ok(content) => return Ok(content),
                Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                    let delay = BACKOFF_CAP.min(BACKOFF_BASE * 2u32.pow(attempt - 1));
                    warn!(
                        model = %options.model,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "model call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn chat_once(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String, ModelError> {
        let mut body = serde_json::json!({
            "model": options.model,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });
        if options.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        if !options.provider_order.is_empty() {
            body["provider"] = serde_json::json!({"order": options.provider_order});
        }

        debug!(model = %options.model, "sending chat completion request");

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header(REFERER_HEADER.0, REFERER_HEADER.1)
            .header(TITLE_HEADER.0, TITLE_HEADER.1)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|err| ModelError::Malformed(err.to_string()))?;

        envelope["choices"][0]["message"]["content"]
            .as_str()
            .map(ToString::to_string)
            .filter(|content| !content.is_empty())
            .ok_or(ModelError::MissingContent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_config::ModelSettings;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(base_url: String) -> ModelSettings {
        ModelSettings {
            api_key: "sk-or-test".into(),
            base_url,
            fast_model: "fast".into(),
            deep_model: "deep".into(),
        }
    }

    fn options() -> ChatOptions {
        ChatOptions {
            model: "fast".into(),
            temperature: 0.1,
            max_tokens: 300,
            json_mode: true,
            provider_order: vec!["Cerebras".into()],
        }
    }

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })
    }

    #[tokio::test]
    async fn test_chat_returns_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-or-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "fast",
                "response_format": {"type": "json_object"},
                "provider": {"order": ["Cerebras"]},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("{\"ok\":true}")))
            .expect(1)
            .mount(&server)
            .await;

        let client = ModelClient::new(&settings(server.uri()));
        let messages = vec![ChatMessage {
            role: "user",
            content: "hi".into(),
        }];
        let content = client.chat(&messages, &options()).await.unwrap();
        assert_eq!(content, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let client = ModelClient::new(&settings(server.uri()));
        let messages = vec![ChatMessage {
            role: "user",
            content: "hi".into(),
        }];
        let err = client.chat(&messages, &options()).await.unwrap_err();
        match err {
            ModelError::Status { status, .. } => assert_eq!(status, 401),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_choices_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .expect(3)
            .mount(&server)
            .await;

        let client = ModelClient::new(&settings(server.uri()));
        let messages = vec![ChatMessage {
            role: "user",
            content: "hi".into(),
        }];
        let err = client.chat(&messages, &options()).await.unwrap_err();
        assert!(matches!(err, ModelError::MissingContent));
    }
}
