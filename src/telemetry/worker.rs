//! Background persister pool for the telemetry queue.
//!
//! A fixed pool of workers pops records and writes them to the audit
//! store. Writes are idempotent keyed by `record_id`; transient failures
//! retry with exponential backoff up to a bounded attempt count, after
//! which the record goes to the dead-letter sink. On shutdown the pool
//! drains the queue for a bounded grace period, then discards the rest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::TelemetryRecord;
use crate::db::fmt_ts;

/// Audit store write failures.
#[derive(Debug, Error)]
pub enum AuditStoreError {
    /// Worth retrying (connection loss, lock contention).
    #[error("transient audit store failure: {0}")]
    Transient(String),
    /// Retrying cannot help (malformed record, constraint violation).
    #[error("permanent audit store failure: {0}")]
    Permanent(String),
}

/// Insert-only audit store collaborator.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist a record. Must be idempotent keyed by `record_id`.
    async fn persist(&self, record: &TelemetryRecord) -> Result<(), AuditStoreError>;

    /// Park a record that exhausted its attempts.
    async fn dead_letter(
        &self,
        record: &TelemetryRecord,
        error: &str,
    ) -> Result<(), AuditStoreError>;
}

/// SQLite-backed audit store.
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    /// Build a store over the given pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn persist(&self, record: &TelemetryRecord) -> Result<(), AuditStoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO telemetry_logs \
             (record_id, timestamp, user_id, project_id, model_name, \
              request_payload, response_payload, cost_micros, latency_ms, outcome) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(record.record_id.to_string())
        .bind(fmt_ts(record.timestamp))
        .bind(record.user_id.map(|u| u.to_string()))
        .bind(&record.project_id)
        .bind(&record.model)
        .bind(record.request_payload.as_ref().map(|v| v.to_string()))
        .bind(record.response_payload.as_ref().map(|v| v.to_string()))
        .bind(record.cost_micros)
        .bind(i64::try_from(record.latency_ms).unwrap_or(i64::MAX))
        .bind(&record.outcome)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| AuditStoreError::Transient(e.to_string()))
    }

    async fn dead_letter(
        &self,
        record: &TelemetryRecord,
        error: &str,
    ) -> Result<(), AuditStoreError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| AuditStoreError::Permanent(e.to_string()))?;
        sqlx::query(
            "INSERT OR IGNORE INTO telemetry_dead_letters (record_id, payload, error, failed_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(record.record_id.to_string())
        .bind(payload)
        .bind(error)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| AuditStoreError::Transient(e.to_string()))
    }
}

/// Worker pool tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pool size.
    pub workers: usize,
    /// Maximum write attempts per record.
    pub max_attempts: u32,
    /// Base delay for exponential backoff.
    pub base_backoff: Duration,
    /// Drain budget after the shutdown signal.
    pub shutdown_grace: Duration,
}

/// Spawn the worker pool. Returns the join handles; send `true` on the
/// shutdown channel to begin draining.
pub fn spawn_workers(
    store: Arc<dyn AuditStore>,
    rx: mpsc::Receiver<TelemetryRecord>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..config.workers.max(1))
        .map(|worker_id| {
            let store = Arc::clone(&store);
            let rx = Arc::clone(&rx);
            let config = config.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(run_worker(worker_id, store, rx, config, shutdown))
        })
        .collect()
}

async fn run_worker(
    worker_id: usize,
    store: Arc<dyn AuditStore>,
    rx: Arc<Mutex<mpsc::Receiver<TelemetryRecord>>>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "telemetry worker started");
    loop {
        let record = {
            let mut guard = rx.lock().await;
            tokio::select! {
                maybe = guard.recv() => maybe,
                _ = shutdown.changed() => None,
            }
        };

        match record {
            Some(record) => write_with_retry(&*store, &record, &config).await,
            None => {
                if *shutdown.borrow() {
                    drain(&*store, &rx, &config).await;
                } else {
                    // Channel closed without a shutdown signal.
                    debug!(worker_id, "telemetry channel closed");
                }
                break;
            }
        }
    }
    debug!(worker_id, "telemetry worker stopped");
}

/// Write one record, retrying transient failures with exponential backoff.
async fn write_with_retry(store: &dyn AuditStore, record: &TelemetryRecord, config: &WorkerConfig) {
    let mut attempt = 0u32;
    loop {
        match store.persist(record).await {
            Ok(()) => return,
            Err(AuditStoreError::Permanent(reason)) => {
                park(store, record, &reason).await;
                return;
            }
            Err(AuditStoreError::Transient(reason)) => {
                attempt += 1;
                if attempt >= config.max_attempts {
                    park(store, record, &reason).await;
                    return;
                }
                let delay = config.base_backoff * 2u32.saturating_pow(attempt - 1);
                warn!(
                    record = %record.record_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "audit write failed; backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn park(store: &dyn AuditStore, record: &TelemetryRecord, reason: &str) {
    if let Err(err) = store.dead_letter(record, reason).await {
        error!(record = %record.record_id, error = %err, "dead-letter write failed; record lost");
    } else {
        warn!(record = %record.record_id, "record dead-lettered");
    }
}

/// Drain remaining records within the grace budget, single attempt each.
async fn drain(
    store: &dyn AuditStore,
    rx: &Arc<Mutex<mpsc::Receiver<TelemetryRecord>>>,
    config: &WorkerConfig,
) {
    let deadline = tokio::time::Instant::now() + config.shutdown_grace;
    let mut drained = 0usize;
    let mut discarded = 0usize;
    loop {
        let record = match rx.lock().await.try_recv() {
            Ok(record) => record,
            Err(_) => break,
        };
        if tokio::time::Instant::now() >= deadline {
            discarded += 1;
            continue;
        }
        if store.persist(&record).await.is_ok() {
            drained += 1;
        } else {
            discarded += 1;
        }
    }
    info!(drained, discarded, "telemetry drain finished");
}
