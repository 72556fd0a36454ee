//! Workbench draft routes.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::db::fmt_ts;
use crate::workbench::{AccessMode, Draft, DraftPatch, DraftStatus, NewDraft, TransitionVerb};

use super::{authenticate, require_project, ApiError, AppState};

/// Draft representation on the wire.
#[derive(Debug, Serialize)]
pub struct DraftResponse {
    /// Identifier.
    pub draft_id: Uuid,
    /// Creating principal.
    pub owner_id: Option<Uuid>,
    /// Owning project.
    pub auc_id: String,
    /// Title.
    pub title: String,
    /// Opaque JSON content.
    pub content: Value,
    /// Runtime fingerprint.
    pub runtime_env: Option<String>,
    /// Approval status.
    pub status: DraftStatus,
    /// Lock holder, expired locks elided.
    pub locked_by: Option<Uuid>,
    /// Lock expiry, RFC 3339.
    pub lock_expires_at: Option<String>,
    /// Access mode granted by this read, when a lock was involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<AccessMode>,
    /// Creation timestamp, RFC 3339.
    pub created_at: String,
    /// Last update, RFC 3339.
    pub updated_at: String,
}

impl DraftResponse {
    fn from_draft(draft: Draft, mode: Option<AccessMode>) -> Self {
        let live = draft.live_lock(chrono::Utc::now());
        Self {
            draft_id: draft.draft_id,
            owner_id: draft.owner_id,
            auc_id: draft.project_id,
            title: draft.title,
            content: draft.content,
            runtime_env: draft.runtime_env,
            status: draft.status,
            locked_by: live.map(|(holder, _)| holder),
            lock_expires_at: live.map(|(_, expires)| fmt_ts(expires)),
            mode,
            created_at: fmt_ts(draft.created_at),
            updated_at: fmt_ts(draft.updated_at),
        }
    }
}

/// Query string for the list route.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Project filter; mandatory.
    pub auc_id: String,
}

/// Body for draft creation.
#[derive(Debug, Deserialize)]
pub struct CreateDraftBody {
    /// Owning project.
    pub auc_id: String,
    /// Title.
    pub title: String,
    /// Opaque JSON content.
    pub content: Value,
    /// Runtime fingerprint.
    #[serde(default)]
    pub runtime_env: Option<String>,
}

/// Body for draft updates; absent fields stay untouched.
#[derive(Debug, Deserialize)]
pub struct UpdateDraftBody {
    /// New title.
    #[serde(default)]
    pub title: Option<String>,
    /// New content.
    #[serde(default)]
    pub content: Option<Value>,
    /// New runtime fingerprint.
    #[serde(default)]
    pub runtime_env: Option<String>,
}

/// `GET /api/v1/workbench/drafts?auc_id=`
pub async fn list_drafts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DraftResponse>>, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    require_project(&principal, &query.auc_id)?;

    let drafts = state.drafts.list(&query.auc_id).await?;
    Ok(Json(
        drafts
            .into_iter()
            .map(|d| DraftResponse::from_draft(d, None))
            .collect(),
    ))
}

/// `POST /api/v1/workbench/drafts`
pub async fn create_draft(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateDraftBody>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    require_project(&principal, &body.auc_id)?;

    let draft = state
        .drafts
        .create(
            &principal,
            NewDraft {
                project_id: body.auc_id,
                title: body.title,
                content: body.content,
                runtime_env: body.runtime_env,
            },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(DraftResponse::from_draft(draft, None)),
    ))
}

/// `GET /api/v1/workbench/drafts/{id}`: acquire lock and return content.
pub async fn get_draft(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(draft_id): Path<Uuid>,
) -> Result<Json<DraftResponse>, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let project = state.drafts.project_of(draft_id).await?;
    require_project(&principal, &project)?;

    let (draft, grant) = state.drafts.get_with_lock(draft_id, &principal).await?;
    Ok(Json(DraftResponse::from_draft(draft, Some(grant.mode))))
}

/// `PUT /api/v1/workbench/drafts/{id}`
pub async fn update_draft(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(draft_id): Path<Uuid>,
    Json(body): Json<UpdateDraftBody>,
) -> Result<Json<DraftResponse>, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let project = state.drafts.project_of(draft_id).await?;
    require_project(&principal, &project)?;

    let draft = state
        .drafts
        .update(
            draft_id,
            &principal,
            DraftPatch {
                title: body.title,
                content: body.content,
                runtime_env: body.runtime_env,
            },
        )
        .await?;
    Ok(Json(DraftResponse::from_draft(draft, None)))
}

/// `POST /api/v1/workbench/drafts/{id}/lock`: heartbeat.
pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(draft_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let project = state.drafts.project_of(draft_id).await?;
    require_project(&principal, &project)?;

    let grant = state.drafts.locks().heartbeat(draft_id, &principal).await?;
    Ok(Json(serde_json::json!({
        "draft_id": draft_id,
        "lock_expires_at": grant.expires_at.map(fmt_ts),
    })))
}

/// `POST /api/v1/workbench/drafts/{id}/{submit|approve|reject}`
pub async fn transition(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((draft_id, verb)): Path<(Uuid, String)>,
) -> Result<Json<DraftResponse>, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    let verb = TransitionVerb::parse(&verb).ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            "unknown transition, expected submit, approve, or reject",
        )
    })?;
    let project = state.drafts.project_of(draft_id).await?;
    require_project(&principal, &project)?;

    let draft = state.drafts.transition(draft_id, &principal, verb).await?;
    Ok(Json(DraftResponse::from_draft(draft, None)))
}
