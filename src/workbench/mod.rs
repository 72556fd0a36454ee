//! Workbench drafts: pessimistic locking and the approval state machine.
//!
//! A draft is editable by at most one principal at a time. Locks carry a
//! 30-second expiry refreshed by heartbeats, a dead-man's switch: a
//! crashed client cannot occupy a draft indefinitely. Managers may read a
//! locked draft in safe-view without displacing the holder. An expired
//! lock is treated as absent everywhere.

mod locks;
mod service;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use locks::LockManager;
pub use service::{DraftPatch, DraftService, NewDraft};

/// Draft approval status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DraftStatus {
    /// Editable working copy.
    Draft,
    /// Submitted, awaiting a manager decision.
    Pending,
    /// Approved by a manager.
    Approved,
    /// Rejected; editable again and may be re-submitted.
    Rejected,
}

impl DraftStatus {
    /// Stored string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(Self::Draft),
            "PENDING" => Some(Self::Pending),
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Whether content edits are allowed in this status.
    pub fn editable(self) -> bool {
        matches!(self, Self::Draft | Self::Rejected)
    }
}

/// How a draft read was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    /// Caller holds the edit lock.
    Edit,
    /// Manager read-only view of a draft locked by someone else.
    SafeView,
}

/// Result of a lock acquisition.
#[derive(Debug, Clone)]
pub struct LockGrant {
    /// Granted mode.
    pub mode: AccessMode,
    /// Current lock holder; populated in safe-view.
    pub holder: Option<Uuid>,
    /// Lock expiry for the granted or observed lock.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Approval state machine verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionVerb {
    /// Owner sends the draft for review.
    Submit,
    /// Manager approves a pending draft.
    Approve,
    /// Manager rejects a pending draft.
    Reject,
}

impl TransitionVerb {
    /// Parse the URL path form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submit" => Some(Self::Submit),
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// A persisted draft.
#[derive(Debug, Clone)]
pub struct Draft {
    /// Identifier.
    pub draft_id: Uuid,
    /// Creating principal.
    pub owner_id: Option<Uuid>,
    /// Owning project.
    pub project_id: String,
    /// Title.
    pub title: String,
    /// Opaque JSON content.
    pub content: Value,
    /// Runtime fingerprint.
    pub runtime_env: Option<String>,
    /// Approval status.
    pub status: DraftStatus,
    /// Lock holder, if any.
    pub locked_by: Option<Uuid>,
    /// Lock expiry; always paired with `locked_by`.
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Soft-delete flag.
    pub is_deleted: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Draft {
    /// The live lock holder, treating an expired lock as absent.
    pub fn live_lock(&self, now: DateTime<Utc>) -> Option<(Uuid, DateTime<Utc>)> {
        match (self.locked_by, self.lock_expires_at) {
            (Some(holder), Some(expires_at)) if now < expires_at => Some((holder, expires_at)),
            _ => None,
        }
    }
}

/// Workbench failures.
#[derive(Debug, Error)]
pub enum WorkbenchError {
    /// Draft does not exist (or is soft-deleted).
    #[error("draft not found")]
    NotFound,
    /// Another principal holds a live lock.
    #[error("draft is locked by another user")]
    LockConflict {
        /// Current holder, when known.
        holder: Option<Uuid>,
        /// Seconds until the lock expires, when known.
        expires_in_secs: Option<i64>,
    },
    /// The caller lacks the required role or ownership.
    #[error("{0}")]
    Forbidden(String),
    /// The operation conflicts with the draft's current status.
    #[error("{0}")]
    Conflict(String),
    /// The backing store failed.
    #[error("draft store failed: {0}")]
    Store(String),
}

impl From<sqlx::Error> for WorkbenchError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.to_string())
    }
}
