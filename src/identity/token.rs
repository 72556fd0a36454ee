//! Compact Ed25519-signed bearer credentials.
//!
//! Format: `base64url(header) "." base64url(claims) "." base64url(signature)`
//! where the signature covers the first two segments. The header names the
//! algorithm (always `EdDSA`) and the key id; the claims carry subject,
//! email, groups, issuer, audience, and validity window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::AuthError;

/// Minimum interval between remote key set fetches.
const KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Default validity window for locally issued credentials.
const ISSUED_TOKEN_TTL_SECS: i64 = 3600;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    kid: String,
}

/// Verified credential claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Stable subject identifier.
    pub sub: Uuid,
    /// Email address.
    pub email: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Group identifiers.
    #[serde(default)]
    pub groups: Vec<Uuid>,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Issuer.
    pub iss: String,
    /// Audience.
    pub aud: String,
}

/// Published verification keys, either static or fetched from a key URL.
///
/// Remote fetches are cached; an unknown key id triggers at most one
/// refresh per [`KEY_REFRESH_INTERVAL`].
pub struct KeySet {
    keys: RwLock<HashMap<String, VerifyingKey>>,
    remote: Option<RemoteKeys>,
}

struct RemoteKeys {
    url: String,
    client: reqwest::Client,
    last_fetch: Mutex<Option<Instant>>,
}

#[derive(Debug, Deserialize)]
struct PublishedKeys {
    keys: Vec<PublishedKey>,
}

#[derive(Debug, Deserialize)]
struct PublishedKey {
    kid: String,
    alg: String,
    key: String,
}

impl KeySet {
    /// Build a key set from static `(kid, key)` pairs.
    pub fn from_static(keys: impl IntoIterator<Item = (String, VerifyingKey)>) -> Self {
        Self {
            keys: RwLock::new(keys.into_iter().collect()),
            remote: None,
        }
    }

    /// Build a key set backed by a remote key URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            remote: Some(RemoteKeys {
                url: url.into(),
                client: reqwest::Client::new(),
                last_fetch: Mutex::new(None),
            }),
        }
    }

    /// Look up a verification key, refreshing from the key URL on a miss.
    pub async fn get(&self, kid: &str) -> Option<VerifyingKey> {
        if let Some(key) = self.keys.read().await.get(kid) {
            return Some(*key);
        }
        self.refresh().await;
        self.keys.read().await.get(kid).copied()
    }

    /// Fetch the published key set if one is configured and the throttle allows.
    async fn refresh(&self) {
        let Some(remote) = &self.remote else {
            return;
        };
        let mut last = remote.last_fetch.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < KEY_REFRESH_INTERVAL {
                return;
            }
        }
        *last = Some(Instant::now());

        let published: PublishedKeys = match remote
            .client
            .get(&remote.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            Ok(resp) => match resp.json().await {
                Ok(body) => body,
                Err(err) => {
                    warn!(error = %err, "identity key set response was not valid JSON");
                    return;
                }
            },
            Err(err) => {
                warn!(error = %err, "identity key set fetch failed");
                return;
            }
        };

        let mut parsed = HashMap::new();
        for entry in published.keys {
            if entry.alg != "EdDSA" {
                continue;
            }
            match decode_verifying_key(&entry.key) {
                Ok(key) => {
                    parsed.insert(entry.kid, key);
                }
                Err(err) => warn!(kid = %entry.kid, error = %err, "skipping unparseable key"),
            }
        }
        debug!(keys = parsed.len(), "identity key set refreshed");
        *self.keys.write().await = parsed;
    }
}

/// Decode a hex-encoded Ed25519 public key.
///
/// # Errors
///
/// Returns an error when the value is not 32 hex-encoded bytes or not a
/// valid curve point.
pub fn decode_verifying_key(hex_key: &str) -> anyhow::Result<VerifyingKey> {
    let bytes = hex::decode(hex_key)?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be 32 bytes"))?;
    Ok(VerifyingKey::from_bytes(&arr)?)
}

/// Verifies compact credentials against a [`KeySet`].
pub struct TokenVerifier {
    keys: Arc<KeySet>,
    issuer: String,
    audience: String,
}

impl TokenVerifier {
    /// Build a verifier for the given key set, issuer, and audience.
    pub fn new(keys: Arc<KeySet>, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    /// Verify a credential and return its claims.
    ///
    /// # Errors
    ///
    /// Returns the matching [`AuthError`] category: malformed structure,
    /// unknown key or bad signature, wrong issuer/audience, or expiry.
    pub async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut parts = token.split('.');
        let (h, c, s) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(c), Some(s), None) => (h, c, s),
            _ => return Err(AuthError::MalformedCredential),
        };

        let header_bytes = URL_SAFE_NO_PAD
            .decode(h)
            .map_err(|_| AuthError::MalformedCredential)?;
        let header: Header =
            serde_json::from_slice(&header_bytes).map_err(|_| AuthError::MalformedCredential)?;
        if header.alg != "EdDSA" {
            return Err(AuthError::MalformedCredential);
        }

        let key = self
            .keys
            .get(&header.kid)
            .await
            .ok_or(AuthError::SignatureInvalid)?;

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| AuthError::MalformedCredential)?;
        let signature =
            Signature::from_slice(&sig_bytes).map_err(|_| AuthError::MalformedCredential)?;

        let signed = format!("{h}.{c}");
        key.verify(signed.as_bytes(), &signature)
            .map_err(|_| AuthError::SignatureInvalid)?;

        let claims_bytes = URL_SAFE_NO_PAD
            .decode(c)
            .map_err(|_| AuthError::MalformedCredential)?;
        let claims: Claims =
            serde_json::from_slice(&claims_bytes).map_err(|_| AuthError::MalformedCredential)?;

        if claims.iss != self.issuer || claims.aud != self.audience {
            return Err(AuthError::SignatureInvalid);
        }
        if claims.exp <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        Ok(claims)
    }
}

/// Issues compact credentials. Used by the mocked SSO device flow and by
/// tests; production deployments verify tokens minted by the real identity
/// provider instead.
pub struct TokenSigner {
    signing_key: SigningKey,
    kid: String,
    issuer: String,
    audience: String,
    groups: Vec<Uuid>,
}

impl TokenSigner {
    /// Generate a fresh ephemeral signing key.
    pub fn ephemeral(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self {
            signing_key,
            kid: "local".to_owned(),
            issuer: issuer.into(),
            audience: audience.into(),
            groups: Vec::new(),
        }
    }

    /// Build a signer from a hex-encoded 32-byte seed.
    ///
    /// # Errors
    ///
    /// Returns an error when the seed is not 32 hex-encoded bytes.
    pub fn from_seed_hex(
        seed_hex: &str,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let bytes = hex::decode(seed_hex)?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("signing seed must be 32 bytes"))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
            kid: "local".to_owned(),
            issuer: issuer.into(),
            audience: audience.into(),
            groups: Vec::new(),
        })
    }

    /// Set the group claims attached to issued credentials.
    pub fn with_groups(mut self, groups: Vec<Uuid>) -> Self {
        self.groups = groups;
        self
    }

    /// The public half of the signing key, hex-encoded for publication.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// A verifier trusting exactly this signer's key.
    pub fn verifier(&self) -> TokenVerifier {
        let keys = KeySet::from_static([(self.kid.clone(), self.signing_key.verifying_key())]);
        TokenVerifier::new(Arc::new(keys), self.issuer.clone(), self.audience.clone())
    }

    /// Issue a credential for the given subject.
    pub fn issue(&self, sub: Uuid, email: &str, name: Option<&str>) -> String {
        let now = Utc::now().timestamp();
        self.issue_with_expiry(sub, email, name, now + ISSUED_TOKEN_TTL_SECS)
    }

    /// Issue a credential with an explicit expiry (tests use this to mint
    /// already-expired tokens).
    pub fn issue_with_expiry(&self, sub: Uuid, email: &str, name: Option<&str>, exp: i64) -> String {
        let header = Header {
            alg: "EdDSA".to_owned(),
            kid: self.kid.clone(),
        };
        let claims = Claims {
            sub,
            email: email.to_owned(),
            name: name.map(str::to_owned),
            groups: self.groups.clone(),
            iat: Utc::now().timestamp(),
            exp,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };

        let h = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).expect("header serializes"));
        let c = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).expect("claims serialize"));
        let signed = format!("{h}.{c}");
        let signature = self.signing_key.sign(signed.as_bytes());
        let s = URL_SAFE_NO_PAD.encode(signature.to_bytes());
        format!("{signed}.{s}")
    }
}
