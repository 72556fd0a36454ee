//! Vault route: encrypt-and-store, never echo.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use super::{authenticate, require_project, ApiError, AppState};

/// Body for `POST /api/v1/vault/secrets`.
#[derive(Debug, Deserialize)]
pub struct CreateSecretBody {
    /// Owning project.
    pub auc_id: String,
    /// Service the key authenticates to (e.g. a provider name).
    pub service_name: String,
    /// The clear-text key. Consumed here; never logged, never echoed.
    pub raw_api_key: String,
}

/// `POST /api/v1/vault/secrets`: seal and store an upstream API key.
pub async fn create_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSecretBody>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, &headers).await?;
    require_project(&principal, &body.auc_id)?;

    if body.raw_api_key.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "raw_api_key must not be empty",
        ));
    }

    let stored = state
        .vault
        .store_secret(
            &body.auc_id,
            &body.service_name,
            &body.raw_api_key,
            Some(principal.user_id),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(stored)))
}
