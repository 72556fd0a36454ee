//! OpenAI-compatible chat completions backend.
//!
//! Speaks the `/chat/completions` wire format against a configurable base
//! URL, so any OpenAI-compatible upstream (or aggregator) works. The model
//! part of a `provider/model` spec is sent upstream; the provider part
//! selects the vault secret and the breaker key at the proxy layer.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use super::{BackendRequest, ChatBackend, InferenceError};

/// Reqwest-based OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiBackend {
    /// Build a backend for the given base URL (e.g. `https://api.openai.com/v1`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    async fn complete(&self, request: BackendRequest<'_>) -> Result<Value, InferenceError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        let body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "seed": request.seed,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(request.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            return Err(InferenceError::UpstreamStatus {
                status: status.as_u16(),
                body: sanitize_error_body(&text),
            });
        }

        serde_json::from_str(&text).map_err(|e| InferenceError::Parse(e.to_string()))
    }
}

/// Map reqwest transport failures onto breaker-relevant categories.
fn classify_transport(err: reqwest::Error) -> InferenceError {
    if err.is_timeout() {
        InferenceError::Timeout
    } else if err.is_connect() {
        InferenceError::Connect(err.to_string())
    } else {
        InferenceError::Parse(err.to_string())
    }
}

/// Collapse, redact, and truncate an upstream error body before it can
/// reach logs or error surfaces.
fn sanitize_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"Bearer [A-Za-z0-9._\-]{10,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_redacts_bearer_keys() {
        let raw = "error: sk-AAAABBBBCCCCDDDDEEEEFFFF00001111222233 rejected";
        let sanitized = sanitize_error_body(raw);
        assert!(!sanitized.contains("sk-AAAA"));
        assert!(sanitized.contains("[REDACTED]"));
    }

    #[test]
    fn error_body_is_truncated() {
        let raw = "x".repeat(1000);
        let sanitized = sanitize_error_body(&raw);
        assert!(sanitized.ends_with("...[truncated]"));
        assert!(sanitized.chars().count() < 300);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_connect_error() {
        let backend = OpenAiBackend::new("http://127.0.0.1:1/v1");
        let err = backend
            .complete(BackendRequest {
                model: "gpt-test",
                messages: &[],
                temperature: 0.0,
                seed: 42,
                api_key: "sk-test",
            })
            .await
            .expect_err("no listener on port 1");
        assert!(err.trips_breaker(), "connection failure must trip the breaker");
    }
}
