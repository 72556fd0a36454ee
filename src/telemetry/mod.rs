//! Non-blocking, bounded handoff of audit records from request scope to a
//! background persister.
//!
//! `enqueue` is fire-and-forget by contract, not as an optimization: the
//! hot path must never wait on the audit store. The channel is bounded; on
//! overflow the record is dropped and a counter incremented. A dropped
//! record never fails the user-visible request.

pub mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::ledger::{LedgerObserver, Micros};

pub use worker::{spawn_workers, AuditStore, AuditStoreError, SqliteAuditStore, WorkerConfig};

/// An immutable audit record. The only representation that reaches the
/// queue; every payload field must already be scrubbed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Idempotency key for the audit store.
    pub record_id: Uuid,
    /// Principal the request ran as.
    pub user_id: Option<Uuid>,
    /// Project the request was authorized against.
    pub project_id: Option<String>,
    /// Model spec.
    pub model: String,
    /// Scrubbed request payload.
    pub request_payload: Option<Value>,
    /// Scrubbed response payload.
    pub response_payload: Option<Value>,
    /// Actual cost in micro-units.
    pub cost_micros: Micros,
    /// Upstream latency in milliseconds.
    pub latency_ms: u64,
    /// Producing request's wall-clock timestamp.
    pub timestamp: DateTime<Utc>,
    /// Outcome category (`ok` or an error category label).
    pub outcome: String,
}

impl TelemetryRecord {
    /// A payload-free marker record (budget overruns, expired
    /// reservations, categorized failures).
    pub fn marker(outcome: impl Into<String>, user_id: Option<Uuid>, model: &str) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            user_id,
            project_id: None,
            model: model.to_owned(),
            request_payload: None,
            response_payload: None,
            cost_micros: 0,
            latency_ms: 0,
            timestamp: Utc::now(),
            outcome: outcome.into(),
        }
    }
}

/// Producer half of the telemetry channel.
pub struct TelemetryQueue {
    tx: mpsc::Sender<TelemetryRecord>,
    dropped: AtomicU64,
    last_drop_warn_secs: AtomicU64,
}

impl TelemetryQueue {
    /// Build the bounded channel; returns the producer handle and the
    /// receiver for the worker pool.
    pub fn bounded(capacity: usize) -> (Arc<Self>, mpsc::Receiver<TelemetryRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                tx,
                dropped: AtomicU64::new(0),
                last_drop_warn_secs: AtomicU64::new(0),
            }),
            rx,
        )
    }

    /// Hand a record to the background persister without blocking.
    ///
    /// On a full queue the record is dropped, the `telemetry_dropped`
    /// counter incremented, and a throttled warning logged. The caller
    /// never sees a failure.
    pub fn enqueue(&self, record: TelemetryRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) | Err(mpsc::error::TrySendError::Closed(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.warn_throttled(total);
            }
        }
    }

    /// Total records dropped since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Log the drop counter at most once per ten seconds.
    fn warn_throttled(&self, total: u64) {
        let now_secs = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        let last = self.last_drop_warn_secs.load(Ordering::Relaxed);
        if now_secs.saturating_sub(last) >= 10
            && self
                .last_drop_warn_secs
                .compare_exchange(last, now_secs, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            warn!(telemetry_dropped = total, "telemetry queue full; dropping records");
        }
    }
}

impl LedgerObserver for TelemetryQueue {
    fn reservation_expired(&self, user_id: Uuid, amount_micros: Micros) {
        let mut record = TelemetryRecord::marker("reservation_expired", Some(user_id), "");
        record.cost_micros = amount_micros;
        self.enqueue(record);
    }

    fn commit_overrun(
        &self,
        user_id: Uuid,
        reserved_micros: Micros,
        actual_micros: Micros,
        clamped: bool,
    ) {
        let outcome = if clamped {
            "budget_overrun_clamped"
        } else {
            "budget_overrun"
        };
        let mut record = TelemetryRecord::marker(outcome, Some(user_id), "");
        record.cost_micros = actual_micros.saturating_sub(reserved_micros);
        self.enqueue(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TelemetryRecord {
        TelemetryRecord::marker("ok", None, "m/x")
    }

    #[tokio::test]
    async fn enqueue_is_nonblocking_and_ordered_per_producer() {
        let (queue, mut rx) = TelemetryQueue::bounded(8);
        for _ in 0..3 {
            queue.enqueue(record());
        }
        assert_eq!(queue.dropped(), 0);
        for _ in 0..3 {
            assert!(rx.try_recv().is_ok());
        }
    }

    #[tokio::test]
    async fn overflow_drops_and_counts() {
        let (queue, _rx) = TelemetryQueue::bounded(2);
        for _ in 0..5 {
            queue.enqueue(record());
        }
        assert_eq!(queue.dropped(), 3);
    }

    #[tokio::test]
    async fn closed_receiver_never_fails_the_caller() {
        let (queue, rx) = TelemetryQueue::bounded(2);
        drop(rx);
        queue.enqueue(record());
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn ledger_observer_enqueues_markers() {
        let (queue, mut rx) = TelemetryQueue::bounded(8);
        let user = Uuid::new_v4();
        queue.reservation_expired(user, 5_000);
        queue.commit_overrun(user, 1_000, 9_000, true);

        let first = rx.try_recv().expect("marker");
        assert_eq!(first.outcome, "reservation_expired");
        assert_eq!(first.cost_micros, 5_000);
        let second = rx.try_recv().expect("marker");
        assert_eq!(second.outcome, "budget_overrun_clamped");
        assert_eq!(second.cost_micros, 8_000);
        assert!(second.request_payload.is_none());
    }
}
