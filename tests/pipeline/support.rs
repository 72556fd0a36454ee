//! Shared mock collaborators for pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use armitage::identity::{Principal, Role};
use armitage::inference::{
    BackendRequest, BreakerConfig, ChatBackend, ChatMessage, InferenceError, InferenceProxy,
    Pricing,
};
use armitage::ledger::{BudgetLedger, InMemoryCounter, LedgerConfig, SpendCounter};
use armitage::pipeline::{CostEstimator, GovernancePipeline};
use armitage::redaction::{PatternDetector, RedactionEngine};
use armitage::telemetry::{TelemetryQueue, TelemetryRecord};
use armitage::vault::{SecretRow, SecretStore, VaultCrypto, VaultReader};

/// In-memory secret store counting fetches, so tests can assert that a
/// budget block never reaches the vault.
#[derive(Default)]
pub struct MemSecretStore {
    rows: Mutex<HashMap<(String, String), SecretRow>>,
    pub fetches: AtomicUsize,
}

#[async_trait]
impl SecretStore for MemSecretStore {
    async fn fetch(
        &self,
        project_id: &str,
        service_name: &str,
    ) -> Result<Option<SecretRow>, String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rows
            .lock()
            .await
            .get(&(project_id.to_owned(), service_name.to_owned()))
            .cloned())
    }

    async fn upsert(&self, row: SecretRow, _created_by: Option<Uuid>) -> Result<Uuid, String> {
        let id = row.secret_id;
        self.rows
            .lock()
            .await
            .insert((row.project_id.clone(), row.service_name.clone()), row);
        Ok(id)
    }
}

/// Backend that replays a script of responses, counting calls.
pub struct ScriptedBackend {
    pub calls: AtomicUsize,
    responses: Mutex<VecDeque<Result<Value, InferenceError>>>,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<Result<Value, InferenceError>>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            responses: Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(&self, _request: BackendRequest<'_>) -> Result<Value, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(InferenceError::Connect("script exhausted".to_owned())))
    }
}

/// An OpenAI-shaped success body.
pub fn ok_body(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}],
        "usage": {"prompt_tokens": 100, "completion_tokens": 50}
    })
}

/// Everything a pipeline test needs to poke at.
pub struct Harness {
    pub pipeline: GovernancePipeline,
    pub counter: Arc<InMemoryCounter>,
    pub ledger: Arc<BudgetLedger>,
    pub store: Arc<MemSecretStore>,
    pub backend: Arc<ScriptedBackend>,
    pub telemetry_rx: mpsc::Receiver<TelemetryRecord>,
}

/// Flat price used by every harness: 10_000 micro-units per 1k tokens, so
/// the canned 150-token usage costs 1_500.
pub const PRICE_MICROS_PER_1K: i64 = 10_000;

/// Build a harness with the given daily limit and backend script. A secret
/// for `("proj-a", "openai")` is pre-seeded.
pub async fn harness(
    daily_limit_micros: i64,
    responses: Vec<Result<Value, InferenceError>>,
) -> Harness {
    harness_with_backend(daily_limit_micros, Arc::new(ScriptedBackend::new(responses))).await
}

/// Build a harness around an arbitrary backend.
pub async fn harness_with_backend(
    daily_limit_micros: i64,
    backend: Arc<ScriptedBackend>,
) -> Harness {
    let (pipeline, counter, ledger, store, telemetry_rx) =
        build(daily_limit_micros, Arc::clone(&backend) as Arc<dyn ChatBackend>).await;
    Harness {
        pipeline,
        counter,
        ledger,
        store,
        backend,
        telemetry_rx,
    }
}

/// Build a pipeline around any `ChatBackend` (for panic-injection tests).
pub async fn build(
    daily_limit_micros: i64,
    backend: Arc<dyn ChatBackend>,
) -> (
    GovernancePipeline,
    Arc<InMemoryCounter>,
    Arc<BudgetLedger>,
    Arc<MemSecretStore>,
    mpsc::Receiver<TelemetryRecord>,
) {
    let (telemetry, telemetry_rx) = TelemetryQueue::bounded(64);

    let counter = Arc::new(InMemoryCounter::new());
    let ledger = Arc::new(BudgetLedger::new(
        Arc::clone(&counter) as Arc<dyn SpendCounter>,
        LedgerConfig {
            daily_limit_micros,
            reserve_grace: Duration::from_secs(60),
            commit_slack_micros: 100_000,
        },
    ));

    let store = Arc::new(MemSecretStore::default());
    let vault = Arc::new(VaultReader::new(
        Arc::clone(&store) as Arc<dyn SecretStore>,
        VaultCrypto::new(&[9u8; 32]),
    ));
    vault
        .store_secret("proj-a", "openai", "sk-seeded", None)
        .await
        .expect("seed secret");
    store.fetches.store(0, Ordering::SeqCst);

    let redaction = Arc::new(RedactionEngine::new(Arc::new(
        PatternDetector::new().with_person_names(["John Doe"]),
    )));

    let proxy = Arc::new(InferenceProxy::new(
        backend,
        BreakerConfig::default(),
        Pricing::flat(PRICE_MICROS_PER_1K),
        Duration::from_secs(2),
    ));

    let pipeline = GovernancePipeline::new(
        Arc::clone(&ledger),
        vault,
        redaction,
        proxy,
        telemetry,
        CostEstimator {
            floor_micros: 10_000,
            micros_per_1k_tokens: PRICE_MICROS_PER_1K,
        },
    );

    (pipeline, counter, ledger, store, telemetry_rx)
}

/// A developer principal with the given project grants.
pub fn principal(projects: &[&str]) -> Principal {
    Principal {
        user_id: Uuid::new_v4(),
        email: "dev@example.com".to_owned(),
        name: None,
        groups: Vec::new(),
        projects: projects.iter().map(|p| (*p).to_owned()).collect(),
        roles: [Role::Developer].into(),
    }
}

/// One user message.
pub fn user_message(content: &str) -> Vec<ChatMessage> {
    vec![ChatMessage {
        role: "user".to_owned(),
        content: content.to_owned(),
    }]
}
