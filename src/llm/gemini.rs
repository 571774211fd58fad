//! Google Gemini provider over the generateContent REST API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{ChatMessage, Provider};
use crate::config::GeminiConfig;
use crate::error::{ConfigError, ProviderError};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const MAX_ATTEMPTS: usize = 3;
const TRY_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Safety categories applied to every call, each blocking at medium and
/// above.
const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];
const SAFETY_THRESHOLD: &str = "BLOCK_MEDIUM_AND_ABOVE";

/// Gemini-backed provider with bounded retries and per-try deadlines.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_output_tokens: u32,
    base_url: String,
}

impl GeminiProvider {
    /// Build a provider from configuration. Fails when no API key is
    /// configured; the factory decides what to fall back to.
    pub fn new(config: &GeminiConfig, client: reqwest::Client) -> Result<Self, ConfigError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or(ConfigError::Missing("GEMINI_API_KEY"))?;
        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
            base_url: GEMINI_API_BASE.to_string(),
        })
    }

    /// Point the provider at a different endpoint (test harnesses).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_request(&self, messages: &[ChatMessage]) -> GenerateContentRequest {
        // Every turn becomes a single text part of the form "role: text".
        let parts = messages
            .iter()
            .map(|m| Part { text: format!("{}: {}", m.role, m.text) })
            .collect();

        GenerateContentRequest {
            contents: vec![Content { parts }],
            safety_settings: SAFETY_CATEGORIES
                .iter()
                .map(|category| SafetySetting { category, threshold: SAFETY_THRESHOLD })
                .collect(),
            generation_config: GenerationConfig { max_output_tokens: self.max_output_tokens },
        }
    }

    async fn call_once(&self, request: &GenerateContentRequest) -> Result<String, ProviderError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| ProviderError::Upstream(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream(format!(
                "generateContent returned status {status}: {body}"
            )));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Upstream(e.to_string()))?;

        Ok(parsed.text())
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    async fn generate(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
    ) -> Result<String, ProviderError> {
        if messages.is_empty() {
            return Err(ProviderError::InvalidArgument("no messages to process".into()));
        }

        let request = self.build_request(messages);
        let mut last_err = ProviderError::EmptyResponse;

        for attempt in 0..MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            if attempt > 0 {
                let backoff = BACKOFF[attempt - 1];
                warn!(attempt = attempt + 1, backoff_secs = backoff.as_secs(), "retrying Gemini API call");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                }
            }

            let outcome = tokio::select! {
                outcome = tokio::time::timeout(TRY_TIMEOUT, self.call_once(&request)) => outcome,
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            };

            match outcome {
                Err(_) => {
                    warn!(attempt = attempt + 1, "Gemini API call hit per-try deadline");
                    last_err = ProviderError::DeadlineExceeded;
                }
                Ok(Err(err)) => {
                    warn!(attempt = attempt + 1, error = %err, "Gemini API call failed");
                    last_err = err;
                }
                Ok(Ok(text)) if text.is_empty() => {
                    warn!(attempt = attempt + 1, "Gemini returned empty response");
                    last_err = ProviderError::EmptyResponse;
                }
                Ok(Ok(text)) => {
                    info!(attempt = attempt + 1, "Gemini API call successful");
                    return Ok(text);
                }
            }
        }

        error!(error = %last_err, "all Gemini API attempts failed");
        Err(last_err)
    }

    fn name(&self) -> &'static str {
        "Gemini-2.5-Flash-Lite"
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    safety_settings: Vec<SafetySetting>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate; empty when the upstream
    /// produced no usable parts.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> GeminiConfig {
        GeminiConfig {
            api_key: Some("test-key".to_string()),
            model: "gemini-2.5-flash-lite".to_string(),
            max_output_tokens: 2048,
        }
    }

    fn provider(base_url: &str) -> GeminiProvider {
        GeminiProvider::new(&config(), reqwest::Client::new())
            .unwrap()
            .with_base_url(base_url)
    }

    fn user(text: &str) -> ChatMessage {
        ChatMessage { role: "user".to_string(), text: text.to_string() }
    }

    fn success_body(text: &str) -> serde_json::Value {
        json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })
    }

    #[test]
    fn test_construction_requires_api_key() {
        let config = GeminiConfig { api_key: None, ..config() };
        assert!(GeminiProvider::new(&config, reqwest::Client::new()).is_err());
    }

    #[tokio::test]
    async fn test_request_shape_carries_safety_and_token_settings() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.5-flash-lite:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(json!({
                "contents": [{ "parts": [
                    { "text": "user: hello" },
                    { "text": "assistant: hi" },
                ] }],
                "safetySettings": [
                    { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_MEDIUM_AND_ABOVE" },
                    { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_MEDIUM_AND_ABOVE" },
                    { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_MEDIUM_AND_ABOVE" },
                    { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_MEDIUM_AND_ABOVE" },
                ],
                "generationConfig": { "maxOutputTokens": 2048 },
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body("hello back")))
            .expect(1)
            .mount(&server)
            .await;

        let reply = provider(&server.uri())
            .generate(
                &CancellationToken::new(),
                &[
                    user("hello"),
                    ChatMessage { role: "assistant".to_string(), text: "hi".to_string() },
                ],
            )
            .await
            .unwrap();
        assert_eq!(reply, "hello back");
    }

    #[tokio::test]
    async fn test_empty_history_is_invalid_argument() {
        let err = provider("http://127.0.0.1:1")
            .generate(&CancellationToken::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_with_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("transient"))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body("ok")))
            .expect(1)
            .mount(&server)
            .await;

        let started = Instant::now();
        let reply = provider(&server.uri())
            .generate(&CancellationToken::new(), &[user("hello")])
            .await
            .unwrap();

        assert_eq!(reply, "ok");
        // Backoff of 1s then 2s before the second and third tries.
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_three_failures_surface_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .expect(3)
            .mount(&server)
            .await;

        let err = provider(&server.uri())
            .generate(&CancellationToken::new(), &[user("hello")])
            .await
            .unwrap_err();
        match err {
            ProviderError::Upstream(msg) => assert!(msg.contains("503")),
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_candidates_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "candidates": [] })))
            .expect(3)
            .mount(&server)
            .await;

        let err = provider(&server.uri())
            .generate(&CancellationToken::new(), &[user("hello")])
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::EmptyResponse);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_try() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = provider("http://127.0.0.1:1")
            .generate(&cancel, &[user("hello")])
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff_sleep() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("transient"))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = provider(&server.uri())
            .generate(&cancel, &[user("hello")])
            .await
            .unwrap_err();

        assert_eq!(err, ProviderError::Cancelled);
        // Cancellation must cut the 1s backoff short.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_response_text_concatenates_parts() {
        let response = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(CandidateContent {
                    parts: vec![
                        CandidatePart { text: Some("foo".into()) },
                        CandidatePart { text: None },
                        CandidatePart { text: Some("bar".into()) },
                    ],
                }),
            }],
        };
        assert_eq!(response.text(), "foobar");
    }
}
