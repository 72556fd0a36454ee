//! The HTTP surface: router, shared state, and server lifecycle.
//!
//! All routes live under `/api/v1` except `/health`. TLS termination is
//! delegated to the fronting ingress; startup configuration refuses a
//! plaintext bind off loopback, so this module only ever serves loopback
//! plaintext or ingress-terminated traffic.

mod auth;
mod chat;
mod error;
mod system;
mod vault;
mod workbench;

use std::sync::Arc;

use axum::http::header;
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use auth::{ApprovedSubject, DeviceFlowBroker};
pub use error::ApiError;
pub use system::ComplianceReport;

use crate::identity::{IdentityResolver, Principal};
use crate::pipeline::GovernancePipeline;
use crate::vault::VaultReader;
use crate::workbench::DraftService;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Environment label for health output.
    pub env_label: String,
    /// Identity resolver (C1).
    pub identity: Arc<IdentityResolver>,
    /// Governance pipeline (C7).
    pub pipeline: Arc<GovernancePipeline>,
    /// Draft service (C8).
    pub drafts: Arc<DraftService>,
    /// Vault reader (C3).
    pub vault: Arc<VaultReader>,
    /// Mocked SSO device-flow broker; absent when no local signer exists.
    pub device_flow: Option<Arc<DeviceFlowBroker>>,
    /// Pre-computed compliance attestation.
    pub compliance: Arc<ComplianceReport>,
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/auth/device-code", post(auth::device_code))
        .route("/auth/token", post(auth::token))
        .route("/chat/completions", post(chat::completions))
        .route("/workbench/drafts", get(workbench::list_drafts))
        .route("/workbench/drafts", post(workbench::create_draft))
        .route("/workbench/drafts/:id", get(workbench::get_draft))
        .route("/workbench/drafts/:id", put(workbench::update_draft))
        .route("/workbench/drafts/:id/lock", post(workbench::heartbeat))
        .route("/workbench/drafts/:id/:verb", post(workbench::transition))
        .route("/vault/secrets", post(vault::create_secret))
        .route("/system/compliance", get(system::compliance));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(system::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error when the bind or the server itself fails.
pub async fn serve(host: &str, port: u16, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = TcpListener::bind((host, port)).await?;
    info!(host, port, "armitage listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("http server stopped");
    Ok(())
}

/// Resolves when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => tracing::error!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

/// Authenticate the request's bearer credential into a principal.
///
/// # Errors
///
/// 401 for missing or invalid credentials, 503 when the directory is down.
pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Principal, ApiError> {
    let Some(raw) = headers.get(header::AUTHORIZATION) else {
        return Err(ApiError::new(
            axum::http::StatusCode::UNAUTHORIZED,
            "missing credential",
        ));
    };
    let raw = raw.to_str().map_err(|_| {
        ApiError::new(axum::http::StatusCode::UNAUTHORIZED, "malformed credential")
    })?;
    let token = raw.strip_prefix("Bearer ").ok_or_else(|| {
        ApiError::new(
            axum::http::StatusCode::UNAUTHORIZED,
            "invalid authentication header format, expected 'Bearer <token>'",
        )
    })?;
    Ok(state.identity.resolve(token).await?)
}

/// 403 unless the principal may act on the project.
pub(crate) fn require_project(principal: &Principal, project_id: &str) -> Result<(), ApiError> {
    if principal.has_project(project_id) {
        return Ok(());
    }
    Err(ApiError::new(
        axum::http::StatusCode::FORBIDDEN,
        format!("not authorized for project {project_id}"),
    ))
}

