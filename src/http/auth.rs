//! Mocked SSO device flow.
//!
//! The real SSO protocol lives in the upstream identity provider; this
//! broker mimics its device-flow surface so that CLIs and notebooks can
//! authenticate against a development deployment. Issued credentials use
//! the same compact Ed25519 format production verifies, signed by a local
//! key the resolver trusts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::identity::TokenSigner;

use super::{ApiError, AppState};

/// How long a device code stays valid.
const DEVICE_CODE_TTL: Duration = Duration::from_secs(600);

/// Minimum interval between polls for one device code.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Access token lifetime reported to clients.
const TOKEN_EXPIRES_IN_SECS: u64 = 3600;

/// Response to `POST /auth/device-code`.
#[derive(Debug, Serialize)]
pub struct DeviceCodeResponse {
    /// Opaque polling handle.
    pub device_code: String,
    /// Short code the user enters at the verification page.
    pub user_code: String,
    /// Where the user goes to approve.
    pub verification_uri: String,
    /// Seconds until the device code expires.
    pub expires_in: u64,
    /// Minimum polling interval in seconds.
    pub interval: u64,
}

/// Request body for `POST /auth/token`.
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    /// The device code being polled.
    pub device_code: String,
}

/// Response to a successful token poll.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    /// Bearer credential.
    pub access_token: String,
    /// Always `Bearer`.
    pub token_type: String,
    /// Seconds until the credential expires.
    pub expires_in: u64,
}

/// An approved subject for a pending device authorization.
#[derive(Debug, Clone)]
pub struct ApprovedSubject {
    /// Subject id.
    pub sub: Uuid,
    /// Email claim.
    pub email: String,
    /// Name claim.
    pub name: Option<String>,
}

#[derive(Debug)]
struct PendingAuth {
    user_code: String,
    created: Instant,
    last_poll: Option<Instant>,
    polls: u32,
    approved: Option<ApprovedSubject>,
}

/// In-memory device-flow state plus the local token signer.
pub struct DeviceFlowBroker {
    signer: TokenSigner,
    verification_uri: String,
    poll_interval: Duration,
    /// Auto-approve as this subject after the first pending poll
    /// (development convenience; `None` requires an explicit approve).
    auto_approve: Option<ApprovedSubject>,
    pending: Mutex<HashMap<String, PendingAuth>>,
}

impl DeviceFlowBroker {
    /// Build a broker issuing tokens with the given signer.
    pub fn new(signer: TokenSigner, verification_uri: impl Into<String>) -> Self {
        Self {
            signer,
            verification_uri: verification_uri.into(),
            poll_interval: POLL_INTERVAL,
            auto_approve: None,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Enable development auto-approval as the given subject.
    pub fn with_auto_approve(mut self, subject: ApprovedSubject) -> Self {
        self.auto_approve = Some(subject);
        self
    }

    /// Override the minimum polling interval (tests).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Start a device authorization.
    pub async fn begin(&self) -> DeviceCodeResponse {
        let device_code = Uuid::new_v4().to_string();
        let user_code = generate_user_code();
        self.pending.lock().await.insert(
            device_code.clone(),
            PendingAuth {
                user_code: user_code.clone(),
                created: Instant::now(),
                last_poll: None,
                polls: 0,
                approved: None,
            },
        );
        debug!(user_code, "device authorization started");
        DeviceCodeResponse {
            device_code,
            user_code,
            verification_uri: self.verification_uri.clone(),
            expires_in: DEVICE_CODE_TTL.as_secs(),
            interval: self.poll_interval.as_secs(),
        }
    }

    /// Approve a pending authorization by its user code.
    ///
    /// Returns whether a matching pending authorization was found.
    pub async fn approve(&self, user_code: &str, subject: ApprovedSubject) -> bool {
        let mut pending = self.pending.lock().await;
        for auth in pending.values_mut() {
            if auth.user_code == user_code {
                auth.approved = Some(subject);
                info!(user_code, "device authorization approved");
                return true;
            }
        }
        false
    }

    /// Poll for a token. Error strings follow the device-flow contract:
    /// `authorization_pending`, `slow_down`, `expired_token`.
    pub async fn poll(&self, device_code: &str) -> Result<TokenResponse, &'static str> {
        let mut pending = self.pending.lock().await;
        let Some(auth) = pending.get_mut(device_code) else {
            return Err("expired_token");
        };

        if auth.created.elapsed() > DEVICE_CODE_TTL {
            pending.remove(device_code);
            return Err("expired_token");
        }

        if let Some(last) = auth.last_poll {
            if last.elapsed() < self.poll_interval {
                return Err("slow_down");
            }
        }
        auth.last_poll = Some(Instant::now());
        auth.polls += 1;

        if auth.approved.is_none() {
            if let Some(dev_subject) = &self.auto_approve {
                if auth.polls >= 2 {
                    auth.approved = Some(dev_subject.clone());
                }
            }
        }

        let Some(subject) = auth.approved.clone() else {
            return Err("authorization_pending");
        };
        pending.remove(device_code);

        let access_token = self
            .signer
            .issue(subject.sub, &subject.email, subject.name.as_deref());
        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_owned(),
            expires_in: TOKEN_EXPIRES_IN_SECS,
        })
    }
}

fn generate_user_code() -> String {
    const ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ23456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn broker(state: &AppState) -> Result<&Arc<DeviceFlowBroker>, ApiError> {
    state.device_flow.as_ref().ok_or_else(|| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "device flow is not configured on this deployment",
        )
    })
}

/// `POST /api/v1/auth/device-code`
pub async fn device_code(
    State(state): State<AppState>,
) -> Result<Json<DeviceCodeResponse>, ApiError> {
    Ok(Json(broker(&state)?.begin().await))
}

/// `POST /api/v1/auth/token`
pub async fn token(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    match broker(&state)?.poll(&request.device_code).await {
        Ok(token) => Ok(Json(token)),
        Err(detail) => Err(ApiError::new(StatusCode::BAD_REQUEST, detail)),
    }
}
