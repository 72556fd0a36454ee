//! The request governance pipeline.
//!
//! Composes identity, ledger, vault, inference, redaction, and telemetry
//! into one strictly ordered chain. Two invariants rule every path:
//!
//! - **No-leak:** only the response returned to the originating caller may
//!   contain unscrubbed content; audit records, logs, and error surfaces
//!   carry scrubbed or categorical data only.
//! - **Budget safety:** every reservation reaches exactly one of commit,
//!   refund, or auto-refund, including on upstream failure, handler
//!   panic, and client cancellation.
//!
//! The post-reservation stages run in a spawned task so that a client
//! disconnect cannot cancel reconciliation mid-flight.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ErrorKind, GovernanceError};
use crate::identity::Principal;
use crate::inference::{parse_model_spec, ChatMessage, InferenceError, InferenceProxy};
use crate::ledger::{BudgetLedger, LedgerError, Micros, ReservationGuard};
use crate::redaction::RedactionEngine;
use crate::telemetry::{TelemetryQueue, TelemetryRecord};
use crate::vault::{VaultError, VaultReader};

/// Per-step deadline for ledger operations.
const LEDGER_DEADLINE: Duration = Duration::from_millis(50);

/// Per-step deadline for vault reads.
const VAULT_DEADLINE: Duration = Duration::from_millis(50);

/// A governed inference request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Project the caller wants to bill and authorize against.
    pub project_id: String,
    /// Model spec in `provider/model` form.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Client cost hint in micro-units; may only raise the reservation.
    pub estimated_cost_hint_micros: Option<Micros>,
    /// Deterministic seed override.
    pub seed: Option<u64>,
}

/// Server-side cost estimation. Token count is approximated from payload
/// bytes; the floor keeps tiny prompts from reserving zero.
#[derive(Debug, Clone)]
pub struct CostEstimator {
    /// Minimum reservation in micro-units.
    pub floor_micros: Micros,
    /// Price per 1000 estimated tokens in micro-units.
    pub micros_per_1k_tokens: Micros,
}

impl CostEstimator {
    /// Estimate the cost of a request. Errs high: the reservation gates,
    /// the commit records truth.
    pub fn estimate(&self, messages: &[ChatMessage]) -> Micros {
        let bytes: usize = messages.iter().map(|m| m.content.len()).sum();
        // Rough 4-bytes-per-token heuristic, doubled to leave room for the
        // completion.
        let estimated_tokens = ((bytes / 4) * 2).max(1) as i64;
        let cost = (i128::from(estimated_tokens) * i128::from(self.micros_per_1k_tokens)) / 1000;
        Micros::try_from(cost)
            .unwrap_or(Micros::MAX)
            .max(self.floor_micros)
    }
}

/// The governance pipeline. See module docs for the chain contract.
pub struct GovernancePipeline {
    ledger: Arc<BudgetLedger>,
    vault: Arc<VaultReader>,
    redaction: Arc<RedactionEngine>,
    proxy: Arc<InferenceProxy>,
    telemetry: Arc<TelemetryQueue>,
    estimator: CostEstimator,
}

impl GovernancePipeline {
    /// Wire the pipeline from its collaborators.
    pub fn new(
        ledger: Arc<BudgetLedger>,
        vault: Arc<VaultReader>,
        redaction: Arc<RedactionEngine>,
        proxy: Arc<InferenceProxy>,
        telemetry: Arc<TelemetryQueue>,
        estimator: CostEstimator,
    ) -> Self {
        Self {
            ledger,
            vault,
            redaction,
            proxy,
            telemetry,
            estimator,
        }
    }

    /// Run one inference request through the full chain.
    ///
    /// Returns the unscrubbed upstream response body; every other exit of
    /// this function carries categorical data only.
    ///
    /// # Errors
    ///
    /// A categorized [`GovernanceError`]; the reservation (if taken) has
    /// been refunded by the time an error is returned.
    pub async fn chat(
        &self,
        principal: &Principal,
        request: ChatRequest,
    ) -> Result<Value, GovernanceError> {
        // 1. Authorization.
        if !principal.has_project(&request.project_id) {
            warn!(
                user = %principal.user_id,
                project = %request.project_id,
                "project authorization denied"
            );
            return Err(GovernanceError::new(
                ErrorKind::Forbidden,
                format!("not authorized for project {}", request.project_id),
            ));
        }

        let (provider, _) = parse_model_spec(&request.model)
            .map_err(|_| GovernanceError::validation("model must be in provider/model form"))?;
        if request.messages.is_empty() {
            return Err(GovernanceError::validation("messages must not be empty"));
        }

        // 2. Reservation. The server-side estimate is authoritative; the
        // client hint may only raise it.
        let mut estimate = self.estimator.estimate(&request.messages);
        if let Some(hint) = request.estimated_cost_hint_micros {
            estimate = estimate.max(hint);
        }
        // The ledger runs its mutations detached, so an expired deadline
        // abandons the observation only; a reservation that still lands is
        // tracked and reclaimed by auto-refund.
        let reserve_outcome =
            tokio::time::timeout(LEDGER_DEADLINE, self.ledger.reserve(principal.user_id, estimate))
                .await
                .map_err(|_| {
                    warn!("ledger reserve exceeded its deadline; failing closed");
                    GovernanceError::new(ErrorKind::Unavailable, "budget service unavailable")
                })?;
        let reservation = match reserve_outcome {
            Ok(reservation) => reservation,
            Err(LedgerError::BudgetExceeded { .. }) => {
                // Budget blocks are pre-secret, pre-inference: nothing is
                // enqueued, by contract.
                return Err(GovernanceError::new(
                    ErrorKind::BudgetExceeded,
                    "Budget exceeded",
                ));
            }
            Err(err) => {
                warn!(error = %err, "ledger unavailable; failing closed");
                return Err(GovernanceError::new(
                    ErrorKind::Unavailable,
                    "budget service unavailable",
                ));
            }
        };
        debug!(
            user = %principal.user_id,
            reservation = %reservation.reservation_id,
            estimate_micros = estimate,
            "reservation taken"
        );

        // 3–7 run detached from the caller so cancellation cannot strand
        // the reservation or skip telemetry.
        let guard = ReservationGuard::new(Arc::clone(&self.ledger), reservation);
        let stages = GovernedStages {
            vault: Arc::clone(&self.vault),
            redaction: Arc::clone(&self.redaction),
            proxy: Arc::clone(&self.proxy),
            telemetry: Arc::clone(&self.telemetry),
        };
        let principal_id = principal.user_id;
        let provider = provider.to_owned();
        let task = tokio::spawn(async move {
            stages
                .run(principal_id, &provider, request, guard)
                .await
        });

        match task.await {
            Ok(result) => result,
            Err(join_err) => {
                // Guard drop inside the panicked task already scheduled the
                // refund; auto-refund remains the backstop.
                warn!(error = %join_err, "governed stages panicked");
                Err(GovernanceError::internal("internal error"))
            }
        }
    }
}

/// The post-reservation stages, owned by a detached task.
struct GovernedStages {
    vault: Arc<VaultReader>,
    redaction: Arc<RedactionEngine>,
    proxy: Arc<InferenceProxy>,
    telemetry: Arc<TelemetryQueue>,
}

impl GovernedStages {
    async fn run(
        &self,
        principal_id: uuid::Uuid,
        provider: &str,
        request: ChatRequest,
        guard: ReservationGuard,
    ) -> Result<Value, GovernanceError> {
        // 3. Secret acquisition.
        let lookup =
            tokio::time::timeout(VAULT_DEADLINE, self.vault.lookup(&request.project_id, provider))
                .await;
        let secret = match lookup {
            Err(_) => {
                return self
                    .fail(
                        principal_id,
                        &request,
                        guard,
                        ErrorKind::Unavailable,
                        "secret store timed out",
                    )
                    .await;
            }
            Ok(Ok(secret)) => secret,
            Ok(Err(err)) => {
                let kind = match err {
                    VaultError::NotFound { .. } | VaultError::SecretCorrupted => {
                        ErrorKind::ConfigurationError
                    }
                    VaultError::Store(_) => ErrorKind::Unavailable,
                };
                return self
                    .fail(principal_id, &request, guard, kind, "secret lookup failed")
                    .await;
            }
        };

        // 4. Inference with deterministic parameters.
        let completion = match self
            .proxy
            .invoke(&request.model, &request.messages, request.seed, &secret)
            .await
        {
            Ok(completion) => completion,
            Err(err) => {
                let (kind, detail) = match &err {
                    InferenceError::Unavailable { retry_after_secs } => (
                        ErrorKind::Unavailable,
                        format!("model upstream unavailable; retry in {retry_after_secs}s"),
                    ),
                    InferenceError::Timeout | InferenceError::Connect(_) => {
                        (ErrorKind::Unavailable, "model upstream unavailable".to_owned())
                    }
                    InferenceError::UpstreamStatus { status, .. } if *status >= 500 => {
                        (ErrorKind::Unavailable, "model upstream unavailable".to_owned())
                    }
                    InferenceError::UpstreamStatus { status, .. } => (
                        ErrorKind::Upstream,
                        format!("model upstream rejected the request ({status})"),
                    ),
                    InferenceError::Parse(_) => {
                        (ErrorKind::Upstream, "model upstream answer unusable".to_owned())
                    }
                };
                return self.fail(principal_id, &request, guard, kind, detail).await;
            }
        };
        // The secret is not needed beyond the upstream call.
        drop(secret);

        // 5. Redaction. Clear-text request and response stop here; only
        // the scrubbed forms survive into the record.
        let request_json = json!(request.messages);
        let scrubbed_request = self.redaction.scrub_value(&request_json);
        let scrubbed_response = Value::String(self.redaction.scrub_text(&completion.content));

        // 6. Reconciliation with the actual cost.
        if let Err(err) = guard.commit(completion.cost_micros).await {
            // The response was served either way; never fail it here.
            warn!(error = %err, "commit failed after successful inference");
        }

        // 7. Telemetry, exactly once per served response.
        self.telemetry.enqueue(TelemetryRecord {
            record_id: uuid::Uuid::new_v4(),
            user_id: Some(principal_id),
            project_id: Some(request.project_id.clone()),
            model: request.model.clone(),
            request_payload: Some(scrubbed_request),
            response_payload: Some(scrubbed_response),
            cost_micros: completion.cost_micros,
            latency_ms: completion.latency_ms,
            timestamp: chrono::Utc::now(),
            outcome: "ok".to_owned(),
        });

        // 8. The unscrubbed body goes back to the originating caller only.
        Ok(completion.body)
    }

    /// Refund and emit a payload-free failure record, then surface the
    /// categorized error.
    async fn fail(
        &self,
        principal_id: uuid::Uuid,
        request: &ChatRequest,
        guard: ReservationGuard,
        kind: ErrorKind,
        detail: impl Into<String>,
    ) -> Result<Value, GovernanceError> {
        if let Err(err) = guard.refund().await {
            warn!(error = %err, "refund failed; auto-refund will reclaim");
        }
        let mut record = TelemetryRecord::marker(kind.as_str(), Some(principal_id), &request.model);
        record.project_id = Some(request.project_id.clone());
        self.telemetry.enqueue(record);
        Err(GovernanceError::new(kind, detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_has_a_floor() {
        let estimator = CostEstimator {
            floor_micros: 10_000,
            micros_per_1k_tokens: 15_000,
        };
        let tiny = vec![ChatMessage {
            role: "user".to_owned(),
            content: "hi".to_owned(),
        }];
        assert_eq!(estimator.estimate(&tiny), 10_000);
    }

    #[test]
    fn estimate_scales_with_payload() {
        let estimator = CostEstimator {
            floor_micros: 10_000,
            micros_per_1k_tokens: 15_000,
        };
        let big = vec![ChatMessage {
            role: "user".to_owned(),
            content: "x".repeat(40_000),
        }];
        // 40k bytes → ~10k tokens → ~20k with completion headroom → 300k micro-units.
        assert_eq!(estimator.estimate(&big), 300_000);
    }
}
