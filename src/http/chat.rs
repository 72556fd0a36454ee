//! The interceptor route: `POST /api/v1/chat/completions`.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::inference::ChatMessage;
use crate::ledger::Micros;
use crate::pipeline::ChatRequest;

use super::{authenticate, ApiError, AppState};

/// Request body. The cost hint is integer micro-units; it can only raise
/// the server-side reservation, never lower it.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionBody {
    /// Project to authorize and bill against.
    pub auc_id: String,
    /// Model spec in `provider/model` form.
    pub model: String,
    /// Conversation.
    pub messages: Vec<ChatMessage>,
    /// Optional client cost hint, micro-units.
    #[serde(default)]
    pub estimated_cost_micros: Option<Micros>,
    /// Optional deterministic seed.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// `POST /api/v1/chat/completions`: the full governance chain.
pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionBody>,
) -> Result<Json<Value>, ApiError> {
    let principal = authenticate(&state, &headers).await?;

    let request = ChatRequest {
        project_id: body.auc_id,
        model: body.model,
        messages: body.messages,
        estimated_cost_hint_micros: body.estimated_cost_micros,
        seed: body.seed,
    };

    let response = state.pipeline.chat(&principal, request).await?;
    Ok(Json(response))
}
