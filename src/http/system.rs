//! Liveness and compliance attestation routes.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::AppState;

/// Pre-computed compliance attestation served by `/system/compliance`.
///
/// The checksum covers the canonical JSON form of the allowlists, so any
/// change to the redaction entity catalogue changes the attestation.
#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    /// SHA-256 over the canonical allowlist JSON.
    pub checksum_sha256: String,
    /// The attested allowlists.
    pub allowlists: Value,
}

impl ComplianceReport {
    /// Build the report from the redaction entity catalogue.
    pub fn new(pii_entities: Vec<String>) -> Self {
        let allowlists = json!({
            "pii_entities": pii_entities,
        });
        let canonical = allowlists.to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        Self {
            checksum_sha256: hex::encode(digest),
            allowlists,
        }
    }
}

/// `GET /api/v1/system/compliance`
pub async fn compliance(State(state): State<AppState>) -> Json<ComplianceReport> {
    Json(state.compliance.as_ref().clone())
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "env": state.env_label }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_tracks_the_catalogue() {
        let a = ComplianceReport::new(vec!["EMAIL_ADDRESS".to_owned()]);
        let b = ComplianceReport::new(vec!["EMAIL_ADDRESS".to_owned()]);
        let c = ComplianceReport::new(vec!["PERSON".to_owned()]);
        assert_eq!(a.checksum_sha256, b.checksum_sha256);
        assert_ne!(a.checksum_sha256, c.checksum_sha256);
        assert_eq!(a.checksum_sha256.len(), 64);
    }
}
