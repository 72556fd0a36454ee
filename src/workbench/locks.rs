//! Pessimistic draft locking.
//!
//! All lock mutations are single-statement conditional UPDATEs, so two
//! concurrent acquirers serialize on the database row itself: exactly one
//! of them matches the guard predicate and wins. Lock exclusivity needs no
//! application-side locking.

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{fmt_ts, parse_ts};
use crate::identity::Principal;

use super::{AccessMode, LockGrant, WorkbenchError};

/// Lock state machine over the `drafts` table.
pub struct LockManager {
    pool: SqlitePool,
    ttl: Duration,
}

impl LockManager {
    /// Build a manager with the given lock time-to-live.
    pub fn new(pool: SqlitePool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    /// The lock duration granted by acquire and heartbeat.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take (or keep) the edit lock on a draft.
    ///
    /// Grants `EDIT` when the draft is unlocked, locked by the caller, or
    /// the existing lock expired. When another principal holds a live lock,
    /// managers get a `SAFE_VIEW` grant without touching the lock, and
    /// everyone else gets `LockConflict`.
    ///
    /// # Errors
    ///
    /// [`WorkbenchError::NotFound`] for missing or soft-deleted drafts,
    /// `LockConflict` as described, `Store` on database failure.
    pub async fn acquire(
        &self,
        draft_id: Uuid,
        principal: &Principal,
    ) -> Result<LockGrant, WorkbenchError> {
        // Two passes: if the CAS loses because a lock expired in between,
        // the re-read classifies and the retry wins.
        for _ in 0..2 {
            let now = Utc::now();
            let expires_at = now
                + chrono::Duration::from_std(self.ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));

            let updated = sqlx::query(
                "UPDATE drafts SET locked_by = ?1, lock_expires_at = ?2 \
                 WHERE draft_id = ?3 AND is_deleted = 0 \
                 AND (locked_by IS NULL OR locked_by = ?1 OR lock_expires_at <= ?4)",
            )
            .bind(principal.user_id.to_string())
            .bind(fmt_ts(expires_at))
            .bind(draft_id.to_string())
            .bind(fmt_ts(now))
            .execute(&self.pool)
            .await?
            .rows_affected();

            if updated == 1 {
                debug!(draft = %draft_id, user = %principal.user_id, "edit lock granted");
                return Ok(LockGrant {
                    mode: AccessMode::Edit,
                    holder: Some(principal.user_id),
                    expires_at: Some(expires_at),
                });
            }

            // Lost the CAS: either the draft is gone or someone holds it.
            let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
                "SELECT locked_by, lock_expires_at FROM drafts \
                 WHERE draft_id = ?1 AND is_deleted = 0",
            )
            .bind(draft_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

            let Some((locked_by, lock_expires_at)) = row else {
                return Err(WorkbenchError::NotFound);
            };

            let holder = locked_by.as_deref().and_then(|s| Uuid::parse_str(s).ok());
            let expires_at = lock_expires_at.as_deref().and_then(|s| parse_ts(s).ok());
            let live = matches!(expires_at, Some(exp) if Utc::now() < exp);

            if !live {
                // Expired between the CAS and the read; retry the CAS.
                continue;
            }

            if principal.is_manager() {
                info!(
                    draft = %draft_id,
                    manager = %principal.user_id,
                    "safe-view grant on locked draft"
                );
                return Ok(LockGrant {
                    mode: AccessMode::SafeView,
                    holder,
                    expires_at,
                });
            }

            warn!(draft = %draft_id, user = %principal.user_id, "lock conflict");
            return Err(WorkbenchError::LockConflict {
                holder,
                expires_in_secs: expires_at
                    .map(|exp| (exp - Utc::now()).num_seconds().max(0)),
            });
        }
        // Both CAS attempts lost to fresh lockers.
        Err(WorkbenchError::LockConflict {
            holder: None,
            expires_in_secs: None,
        })
    }

    /// Refresh the lock expiry; only the live holder may do this.
    ///
    /// # Errors
    ///
    /// `LockConflict` when the caller does not hold a live lock,
    /// `NotFound` when the draft is missing.
    pub async fn heartbeat(
        &self,
        draft_id: Uuid,
        principal: &Principal,
    ) -> Result<LockGrant, WorkbenchError> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let updated = sqlx::query(
            "UPDATE drafts SET lock_expires_at = ?1 \
             WHERE draft_id = ?2 AND is_deleted = 0 \
             AND locked_by = ?3 AND lock_expires_at > ?4",
        )
        .bind(fmt_ts(expires_at))
        .bind(draft_id.to_string())
        .bind(principal.user_id.to_string())
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(LockGrant {
                mode: AccessMode::Edit,
                holder: Some(principal.user_id),
                expires_at: Some(expires_at),
            });
        }

        let exists: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM drafts WHERE draft_id = ?1 AND is_deleted = 0")
                .bind(draft_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_none() {
            return Err(WorkbenchError::NotFound);
        }
        Err(WorkbenchError::LockConflict {
            holder: None,
            expires_in_secs: None,
        })
    }

    /// Verify the caller holds a live lock before a content mutation.
    ///
    /// # Errors
    ///
    /// `LockConflict` when the lock is absent, expired, or held by someone
    /// else; `NotFound` when the draft is missing.
    pub async fn verify_for_update(
        &self,
        draft_id: Uuid,
        principal: &Principal,
    ) -> Result<(), WorkbenchError> {
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT locked_by, lock_expires_at FROM drafts \
             WHERE draft_id = ?1 AND is_deleted = 0",
        )
        .bind(draft_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some((locked_by, lock_expires_at)) = row else {
            return Err(WorkbenchError::NotFound);
        };
        let holder = locked_by.as_deref().and_then(|s| Uuid::parse_str(s).ok());
        let expires_at = lock_expires_at.as_deref().and_then(|s| parse_ts(s).ok());
        let live = matches!(expires_at, Some(exp) if Utc::now() < exp);

        if holder == Some(principal.user_id) && live {
            return Ok(());
        }
        Err(WorkbenchError::LockConflict {
            holder: holder.filter(|_| live),
            expires_in_secs: expires_at
                .filter(|_| live)
                .map(|exp| (exp - Utc::now()).num_seconds().max(0)),
        })
    }
}
