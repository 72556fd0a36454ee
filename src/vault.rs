//! Encrypted secret store: sealing, scoped decryption, request-scoped material.
//!
//! Secrets are sealed with AES-256-GCM under a process-wide master key
//! loaded once at startup. The at-rest form is
//! `base64(iv_12 ‖ ciphertext ‖ tag_16)` plus a key-version identifier.
//! Decrypted material lives in a [`SecretMaterial`] that is zeroized on
//! drop, cannot be cloned, and debug-prints as `__REDACTED__`; it must
//! never outlive the handler frame that fetched it.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::db::fmt_ts;

/// AES-GCM nonce length in bytes.
const IV_LEN: usize = 12;

/// Current key-version identifier written on new seals.
const KEY_VERSION: &str = "v1";

/// Clear-text secret bytes scoped to one request.
///
/// Not `Clone`: ownership stays with the handler frame that fetched it.
pub struct SecretMaterial(Zeroizing<String>);

impl SecretMaterial {
    /// Wrap clear-text material.
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }

    /// Expose the material. Use only at the point of injection into an
    /// upstream request; never copy into a longer-lived container.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("__REDACTED__")
    }
}

/// Vault failures.
#[derive(Debug, Error)]
pub enum VaultError {
    /// No secret exists for the `(project, service)` pair.
    #[error("no secret configured for service {service} in project {project}")]
    NotFound {
        /// Project identifier.
        project: String,
        /// Service name.
        service: String,
    },
    /// Authentication tag mismatch or undecodable sealed value.
    #[error("stored secret failed integrity check")]
    SecretCorrupted,
    /// The backing store could not be queried.
    #[error("secret store unavailable: {0}")]
    Store(String),
}

/// A sealed secret row.
#[derive(Debug, Clone)]
pub struct SecretRow {
    /// Row identifier.
    pub secret_id: Uuid,
    /// Owning project.
    pub project_id: String,
    /// Service the secret authenticates to (e.g. provider name).
    pub service_name: String,
    /// `base64(iv ‖ ciphertext ‖ tag)`.
    pub sealed_value: String,
    /// Master-key version the seal was made under.
    pub key_version: String,
}

/// Metadata returned after storing a secret. Never echoes the raw value.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoredSecret {
    /// Row identifier.
    pub secret_id: Uuid,
    /// Owning project (serialized as `auc_id` on the wire).
    #[serde(rename = "auc_id")]
    pub project_id: String,
    /// Service name.
    pub service_name: String,
    /// Creation timestamp, RFC 3339.
    pub created_at: String,
}

/// Persistence collaborator for sealed secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the sealed row for a `(project, service)` pair.
    async fn fetch(
        &self,
        project_id: &str,
        service_name: &str,
    ) -> Result<Option<SecretRow>, String>;

    /// Insert or replace the sealed row, returning its id.
    async fn upsert(&self, row: SecretRow, created_by: Option<Uuid>) -> Result<Uuid, String>;
}

/// SQLite-backed secret store.
pub struct SqliteSecretStore {
    pool: SqlitePool,
}

impl SqliteSecretStore {
    /// Build a store over the given pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecretStore for SqliteSecretStore {
    async fn fetch(
        &self,
        project_id: &str,
        service_name: &str,
    ) -> Result<Option<SecretRow>, String> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT secret_id, sealed_value, key_version FROM vault_secrets \
             WHERE project_id = ?1 AND service_name = ?2",
        )
        .bind(project_id)
        .bind(service_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(row.map(|(id, sealed_value, key_version)| SecretRow {
            secret_id: Uuid::parse_str(&id).unwrap_or_default(),
            project_id: project_id.to_owned(),
            service_name: service_name.to_owned(),
            sealed_value,
            key_version,
        }))
    }

    async fn upsert(&self, row: SecretRow, created_by: Option<Uuid>) -> Result<Uuid, String> {
        sqlx::query(
            "INSERT INTO vault_secrets \
             (secret_id, project_id, service_name, sealed_value, key_version, created_by, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(project_id, service_name) DO UPDATE SET \
             sealed_value = ?4, key_version = ?5, created_by = ?6, created_at = ?7",
        )
        .bind(row.secret_id.to_string())
        .bind(&row.project_id)
        .bind(&row.service_name)
        .bind(&row.sealed_value)
        .bind(&row.key_version)
        .bind(created_by.map(|u| u.to_string()))
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        // The upsert keeps the original secret_id on conflict; read it back.
        let (id,): (String,) = sqlx::query_as(
            "SELECT secret_id FROM vault_secrets WHERE project_id = ?1 AND service_name = ?2",
        )
        .bind(&row.project_id)
        .bind(&row.service_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Uuid::parse_str(&id).map_err(|e| e.to_string())
    }
}

/// AES-256-GCM seal/open under the process master key.
pub struct VaultCrypto {
    cipher: Aes256Gcm,
}

impl VaultCrypto {
    /// Build from the 32-byte master key.
    pub fn new(master_key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(master_key)),
        }
    }

    /// Seal clear-text into the at-rest form.
    pub fn seal(&self, plaintext: &[u8]) -> String {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .expect("AES-GCM encryption cannot fail for in-memory buffers");

        let mut combined = Vec::with_capacity(IV_LEN + ciphertext.len());
        combined.extend_from_slice(&iv);
        combined.extend_from_slice(&ciphertext);
        BASE64.encode(combined)
    }

    /// Open the at-rest form back into clear-text.
    ///
    /// # Errors
    ///
    /// [`VaultError::SecretCorrupted`] on undecodable input or tag mismatch.
    pub fn open(&self, sealed: &str) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let combined = BASE64
            .decode(sealed)
            .map_err(|_| VaultError::SecretCorrupted)?;
        if combined.len() <= IV_LEN {
            return Err(VaultError::SecretCorrupted);
        }
        let (iv, ciphertext) = combined.split_at(IV_LEN);
        let nonce = Nonce::from_slice(iv);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::SecretCorrupted)?;
        Ok(Zeroizing::new(plaintext))
    }
}

/// Resolves `(project, service)` pairs to request-scoped clear-text.
pub struct VaultReader {
    store: Arc<dyn SecretStore>,
    crypto: VaultCrypto,
}

impl VaultReader {
    /// Build a reader over a store and the process crypto.
    pub fn new(store: Arc<dyn SecretStore>, crypto: VaultCrypto) -> Self {
        Self { store, crypto }
    }

    /// Fetch and decrypt the secret for a `(project, service)` pair.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotFound`] when no row exists, `SecretCorrupted` on a
    /// failed integrity check, `Store` when the store is unreachable.
    pub async fn lookup(
        &self,
        project_id: &str,
        service_name: &str,
    ) -> Result<SecretMaterial, VaultError> {
        let row = self
            .store
            .fetch(project_id, service_name)
            .await
            .map_err(VaultError::Store)?
            .ok_or_else(|| VaultError::NotFound {
                project: project_id.to_owned(),
                service: service_name.to_owned(),
            })?;

        let plaintext = self.crypto.open(&row.sealed_value)?;
        let value = String::from_utf8(plaintext.to_vec())
            .map_err(|_| VaultError::SecretCorrupted)?;
        debug!(project = project_id, service = service_name, "secret resolved");
        Ok(SecretMaterial::new(value))
    }

    /// Seal and store a secret, returning metadata only.
    ///
    /// # Errors
    ///
    /// [`VaultError::Store`] when the store is unreachable.
    pub async fn store_secret(
        &self,
        project_id: &str,
        service_name: &str,
        raw_value: &str,
        created_by: Option<Uuid>,
    ) -> Result<StoredSecret, VaultError> {
        let sealed_value = self.crypto.seal(raw_value.as_bytes());
        let row = SecretRow {
            secret_id: Uuid::new_v4(),
            project_id: project_id.to_owned(),
            service_name: service_name.to_owned(),
            sealed_value,
            key_version: KEY_VERSION.to_owned(),
        };
        let secret_id = self
            .store
            .upsert(row, created_by)
            .await
            .map_err(VaultError::Store)?;
        Ok(StoredSecret {
            secret_id,
            project_id: project_id.to_owned(),
            service_name: service_name.to_owned(),
            created_at: fmt_ts(Utc::now()),
        })
    }
}
