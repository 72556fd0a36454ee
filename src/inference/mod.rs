//! Inference proxy: circuit-breaker-guarded upstream model calls with
//! deterministic parameters.
//!
//! The proxy forces `temperature = 0.0` and injects a fixed default seed
//! when the caller omits one, so the same prompt yields the same completion
//! across runs. Every `(model)` gets its own [`CircuitBreaker`]; timeouts,
//! 5xx responses, and connection errors count as breaker failures while
//! client-side 4xx do not.

pub mod breaker;
mod openai;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use openai::OpenAiBackend;

use crate::ledger::Micros;
use crate::vault::SecretMaterial;

/// Seed injected when the caller does not supply one.
pub const DEFAULT_SEED: u64 = 42;

/// One message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role (`system`, `user`, `assistant`, `tool`).
    pub role: String,
    /// Message text.
    pub content: String,
}

/// Token usage reported by the upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Tokens generated in the completion.
    #[serde(default)]
    pub completion_tokens: u64,
}

/// A successful upstream completion.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Full upstream response body, returned verbatim to the caller.
    pub body: Value,
    /// Extracted assistant message text (empty when absent).
    pub content: String,
    /// Reported token usage.
    pub usage: TokenUsage,
    /// Actual cost in micro-units, derived from usage and pricing.
    pub cost_micros: Micros,
    /// Wall-clock latency of the upstream call.
    pub latency_ms: u64,
}

/// Inference failures, pre-classified for the breaker and the pipeline.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The breaker is open; retry after the given cooldown.
    #[error("model upstream unavailable; retry in {retry_after_secs}s")]
    Unavailable {
        /// Seconds until the next probe is admitted.
        retry_after_secs: u64,
    },
    /// The upstream call exceeded its deadline.
    #[error("model call timed out")]
    Timeout,
    /// The upstream could not be reached.
    #[error("model connection failed: {0}")]
    Connect(String),
    /// The upstream answered with a non-success status.
    #[error("model returned status {status}")]
    UpstreamStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized, truncated body excerpt.
        body: String,
    },
    /// The upstream body did not parse.
    #[error("model response unparseable: {0}")]
    Parse(String),
}

impl InferenceError {
    /// Whether this failure counts toward tripping the breaker.
    ///
    /// Timeouts, connection errors, and 5xx count; 4xx and parse errors do
    /// not (they indicate a bad request, not an unhealthy upstream).
    pub fn trips_breaker(&self) -> bool {
        match self {
            Self::Timeout | Self::Connect(_) => true,
            Self::UpstreamStatus { status, .. } => *status >= 500,
            Self::Unavailable { .. } | Self::Parse(_) => false,
        }
    }
}

/// Parameters handed to a backend for one upstream call.
#[derive(Debug)]
pub struct BackendRequest<'a> {
    /// Model identifier as the upstream expects it.
    pub model: &'a str,
    /// Conversation.
    pub messages: &'a [ChatMessage],
    /// Forced sampling temperature (always 0.0 from the proxy).
    pub temperature: f32,
    /// Deterministic seed.
    pub seed: u64,
    /// Bearer credential for the upstream.
    pub api_key: &'a str,
}

/// Upstream chat completion collaborator.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Place one completion call. Implementations classify transport
    /// failures into the matching [`InferenceError`] variants.
    async fn complete(&self, request: BackendRequest<'_>) -> Result<Value, InferenceError>;
}

/// Per-model pricing in micro-units per 1000 tokens.
#[derive(Debug, Clone)]
pub struct Pricing {
    /// Fallback price for models without an explicit entry.
    pub default_micros_per_1k: Micros,
    /// Model-specific overrides.
    pub per_model_micros_per_1k: HashMap<String, Micros>,
}

impl Pricing {
    /// Flat pricing for every model.
    pub fn flat(micros_per_1k: Micros) -> Self {
        Self {
            default_micros_per_1k: micros_per_1k,
            per_model_micros_per_1k: HashMap::new(),
        }
    }

    fn cost(&self, model: &str, usage: TokenUsage) -> Micros {
        let rate = self
            .per_model_micros_per_1k
            .get(model)
            .copied()
            .unwrap_or(self.default_micros_per_1k);
        let total_tokens = usage.prompt_tokens.saturating_add(usage.completion_tokens);
        let cost = (i128::from(total_tokens) * i128::from(rate)) / 1000;
        Micros::try_from(cost).unwrap_or(Micros::MAX)
    }
}

/// Parse a `provider/model` spec into its components.
///
/// # Errors
///
/// Returns an error when the string does not contain exactly one
/// non-empty provider and model part.
pub fn parse_model_spec(spec: &str) -> Result<(&str, &str), InferenceError> {
    let (provider, model) = spec
        .split_once('/')
        .ok_or_else(|| InferenceError::Parse(format!("invalid model spec {spec:?}")))?;
    if provider.is_empty() || model.is_empty() {
        return Err(InferenceError::Parse(format!("invalid model spec {spec:?}")));
    }
    Ok((provider, model))
}

/// The inference proxy. One breaker per model, shared pricing and deadline.
pub struct InferenceProxy {
    backend: Arc<dyn ChatBackend>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    breaker_config: BreakerConfig,
    pricing: Pricing,
    deadline: Duration,
    default_seed: u64,
}

impl InferenceProxy {
    /// Build a proxy over a backend.
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        breaker_config: BreakerConfig,
        pricing: Pricing,
        deadline: Duration,
    ) -> Self {
        Self {
            backend,
            breakers: Mutex::new(HashMap::new()),
            breaker_config,
            pricing,
            deadline,
            default_seed: DEFAULT_SEED,
        }
    }

    /// Override the default seed (configuration hook).
    pub fn with_default_seed(mut self, seed: u64) -> Self {
        self.default_seed = seed;
        self
    }

    /// The breaker guarding `model`, created on first use.
    pub async fn breaker_for(&self, model: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        Arc::clone(
            breakers
                .entry(model.to_owned())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.breaker_config.clone()))),
        )
    }

    /// Invoke the upstream model with deterministic parameters.
    ///
    /// # Errors
    ///
    /// [`InferenceError::Unavailable`] when the breaker refuses the call;
    /// otherwise the classified upstream failure.
    pub async fn invoke(
        &self,
        model: &str,
        messages: &[ChatMessage],
        seed: Option<u64>,
        secret: &SecretMaterial,
    ) -> Result<Completion, InferenceError> {
        let breaker = self.breaker_for(model).await;
        breaker
            .try_admit()
            .map_err(|cooldown| InferenceError::Unavailable {
                retry_after_secs: cooldown.as_secs().max(1),
            })?;

        let request = BackendRequest {
            model,
            messages,
            temperature: 0.0,
            seed: seed.unwrap_or(self.default_seed),
            api_key: secret.expose(),
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.deadline, self.backend.complete(request)).await
        {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Timeout),
        };
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(body) => {
                breaker.record_success();
                let usage = extract_usage(&body);
                let content = extract_content(&body);
                let cost_micros = self.pricing.cost(model, usage);
                debug!(model, latency_ms, cost_micros, "inference completed");
                Ok(Completion {
                    body,
                    content,
                    usage,
                    cost_micros,
                    latency_ms,
                })
            }
            Err(err) => {
                if err.trips_breaker() {
                    breaker.record_failure();
                } else {
                    // A 4xx or parse failure still proves the upstream is
                    // reachable; this also resolves a half-open probe.
                    breaker.record_success();
                }
                warn!(model, latency_ms, error = %err, "inference failed");
                Err(err)
            }
        }
    }
}

/// Pull token usage out of an OpenAI-shaped response body.
fn extract_usage(body: &Value) -> TokenUsage {
    serde_json::from_value(body.get("usage").cloned().unwrap_or(Value::Null))
        .unwrap_or_default()
}

/// Pull the first choice's message text out of an OpenAI-shaped body.
fn extract_content(body: &Value) -> String {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}
