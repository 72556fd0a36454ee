//! The HTTP error envelope and category-to-status mapping.
//!
//! Every failure crossing the HTTP boundary is `{ "detail": "<string>" }`
//! with the status code carrying the contract. Only categorized errors get
//! here; raw collaborator messages never do.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::{ErrorKind, GovernanceError};
use crate::identity::AuthError;
use crate::vault::VaultError;
use crate::workbench::WorkbenchError;

/// A response-ready error.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Human-readable detail for the envelope.
    pub detail: String,
}

impl ApiError {
    /// Build from status and detail.
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

/// Map an error category to its status code.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::AuthMissing | ErrorKind::AuthInvalid => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::BudgetExceeded => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::LockConflict => StatusCode::LOCKED,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        ErrorKind::ConfigurationError | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<GovernanceError> for ApiError {
    fn from(err: GovernanceError) -> Self {
        Self::new(status_for(err.kind), err.detail)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Directory(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "authorization service unavailable",
            ),
            other => Self::new(StatusCode::UNAUTHORIZED, other.to_string()),
        }
    }
}

impl From<WorkbenchError> for ApiError {
    fn from(err: WorkbenchError) -> Self {
        match &err {
            WorkbenchError::NotFound => Self::new(StatusCode::NOT_FOUND, "Draft not found"),
            WorkbenchError::LockConflict { expires_in_secs, .. } => {
                let detail = match expires_in_secs {
                    Some(secs) => format!(
                        "Draft is currently being edited by another user (lock expires in {secs}s)"
                    ),
                    None => "You must hold the draft lock to do this".to_owned(),
                };
                Self::new(StatusCode::LOCKED, detail)
            }
            WorkbenchError::Forbidden(detail) => Self::new(StatusCode::FORBIDDEN, detail.clone()),
            WorkbenchError::Conflict(detail) => Self::new(StatusCode::CONFLICT, detail.clone()),
            WorkbenchError::Store(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            VaultError::SecretCorrupted | VaultError::Store(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Secure vault access failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_contract() {
        assert_eq!(status_for(ErrorKind::BudgetExceeded), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(status_for(ErrorKind::LockConflict), StatusCode::LOCKED);
        assert_eq!(status_for(ErrorKind::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::Upstream), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::Forbidden), StatusCode::FORBIDDEN);
    }
}
