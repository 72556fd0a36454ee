//! Draft CRUD and the approval state machine on top of the lock manager.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{fmt_ts, parse_ts};
use crate::identity::Principal;

use super::{Draft, DraftStatus, LockGrant, LockManager, TransitionVerb, WorkbenchError};

/// Fields for a new draft.
#[derive(Debug, Clone)]
pub struct NewDraft {
    /// Owning project.
    pub project_id: String,
    /// Title.
    pub title: String,
    /// Opaque JSON content.
    pub content: Value,
    /// Runtime fingerprint.
    pub runtime_env: Option<String>,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct DraftPatch {
    /// New title.
    pub title: Option<String>,
    /// New content.
    pub content: Option<Value>,
    /// New runtime fingerprint.
    pub runtime_env: Option<String>,
}

/// Draft operations gated by locks, ownership, and roles.
pub struct DraftService {
    pool: SqlitePool,
    locks: Arc<LockManager>,
}

impl DraftService {
    /// Build a service sharing the lock manager.
    pub fn new(pool: SqlitePool, locks: Arc<LockManager>) -> Self {
        Self { pool, locks }
    }

    /// The lock manager, for the heartbeat route.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Create a draft owned by the principal.
    ///
    /// # Errors
    ///
    /// [`WorkbenchError::Store`] on database failure.
    pub async fn create(
        &self,
        principal: &Principal,
        new_draft: NewDraft,
    ) -> Result<Draft, WorkbenchError> {
        let draft_id = Uuid::new_v4();
        let now = fmt_ts(Utc::now());
        sqlx::query(
            "INSERT INTO drafts \
             (draft_id, owner_id, project_id, title, content, runtime_env, status, \
              is_deleted, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'DRAFT', 0, ?7, ?7)",
        )
        .bind(draft_id.to_string())
        .bind(principal.user_id.to_string())
        .bind(&new_draft.project_id)
        .bind(&new_draft.title)
        .bind(new_draft.content.to_string())
        .bind(&new_draft.runtime_env)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        info!(draft = %draft_id, project = %new_draft.project_id, "draft created");
        self.fetch(draft_id).await?.ok_or(WorkbenchError::NotFound)
    }

    /// List a project's drafts, newest first, soft-deleted excluded.
    ///
    /// # Errors
    ///
    /// [`WorkbenchError::Store`] on database failure.
    pub async fn list(&self, project_id: &str) -> Result<Vec<Draft>, WorkbenchError> {
        let rows: Vec<DraftRow> = sqlx::query_as(
            "SELECT draft_id, owner_id, project_id, title, content, runtime_env, status, \
             locked_by, lock_expires_at, is_deleted, created_at, updated_at \
             FROM drafts WHERE project_id = ?1 AND is_deleted = 0 \
             ORDER BY updated_at DESC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DraftRow::into_draft).collect()
    }

    /// Acquire a lock (or safe-view) and return the draft.
    ///
    /// # Errors
    ///
    /// Propagates [`LockManager::acquire`] failures.
    pub async fn get_with_lock(
        &self,
        draft_id: Uuid,
        principal: &Principal,
    ) -> Result<(Draft, LockGrant), WorkbenchError> {
        let grant = self.locks.acquire(draft_id, principal).await?;
        let draft = self.fetch(draft_id).await?.ok_or(WorkbenchError::NotFound)?;
        Ok((draft, grant))
    }

    /// Update draft content under a live lock.
    ///
    /// Requires an editable status (`DRAFT` or `REJECTED`); a pending or
    /// approved draft answers `Conflict`.
    ///
    /// # Errors
    ///
    /// `LockConflict`, `Conflict`, `NotFound`, or `Store`.
    pub async fn update(
        &self,
        draft_id: Uuid,
        principal: &Principal,
        patch: DraftPatch,
    ) -> Result<Draft, WorkbenchError> {
        self.locks.verify_for_update(draft_id, principal).await?;

        let draft = self.fetch(draft_id).await?.ok_or(WorkbenchError::NotFound)?;
        if !draft.status.editable() {
            return Err(WorkbenchError::Conflict(format!(
                "cannot edit draft in {} status",
                draft.status.as_str()
            )));
        }

        let title = patch.title.unwrap_or(draft.title);
        let content = patch.content.unwrap_or(draft.content);
        let runtime_env = patch.runtime_env.or(draft.runtime_env);
        sqlx::query(
            "UPDATE drafts SET title = ?1, content = ?2, runtime_env = ?3, updated_at = ?4 \
             WHERE draft_id = ?5",
        )
        .bind(&title)
        .bind(content.to_string())
        .bind(&runtime_env)
        .bind(fmt_ts(Utc::now()))
        .bind(draft_id.to_string())
        .execute(&self.pool)
        .await?;

        debug!(draft = %draft_id, "draft updated");
        self.fetch(draft_id).await?.ok_or(WorkbenchError::NotFound)
    }

    /// Drive the approval state machine.
    ///
    /// `submit` requires ownership and an editable status; `approve` and
    /// `reject` require the manager role and a pending draft. Anything
    /// else is `Conflict`.
    ///
    /// # Errors
    ///
    /// `Forbidden`, `Conflict`, `NotFound`, or `Store`.
    pub async fn transition(
        &self,
        draft_id: Uuid,
        principal: &Principal,
        verb: TransitionVerb,
    ) -> Result<Draft, WorkbenchError> {
        let draft = self.fetch(draft_id).await?.ok_or(WorkbenchError::NotFound)?;

        let new_status = match verb {
            TransitionVerb::Submit => {
                if draft.owner_id != Some(principal.user_id) {
                    return Err(WorkbenchError::Forbidden(
                        "only the draft owner may submit".to_owned(),
                    ));
                }
                if !draft.status.editable() {
                    return Err(WorkbenchError::Conflict(format!(
                        "cannot submit draft in {} status",
                        draft.status.as_str()
                    )));
                }
                DraftStatus::Pending
            }
            TransitionVerb::Approve | TransitionVerb::Reject => {
                if !principal.is_manager() {
                    return Err(WorkbenchError::Forbidden(
                        "approval decisions require the manager role".to_owned(),
                    ));
                }
                if draft.status != DraftStatus::Pending {
                    return Err(WorkbenchError::Conflict(format!(
                        "draft is in {} status, expected PENDING",
                        draft.status.as_str()
                    )));
                }
                if verb == TransitionVerb::Approve {
                    DraftStatus::Approved
                } else {
                    DraftStatus::Rejected
                }
            }
        };

        sqlx::query("UPDATE drafts SET status = ?1, updated_at = ?2 WHERE draft_id = ?3")
            .bind(new_status.as_str())
            .bind(fmt_ts(Utc::now()))
            .bind(draft_id.to_string())
            .execute(&self.pool)
            .await?;

        info!(
            draft = %draft_id,
            from = draft.status.as_str(),
            to = new_status.as_str(),
            "draft transitioned"
        );
        self.fetch(draft_id).await?.ok_or(WorkbenchError::NotFound)
    }

    /// The owning project of a draft, for pre-lock authorization checks.
    ///
    /// # Errors
    ///
    /// `NotFound` for missing or soft-deleted drafts, `Store` on failure.
    pub async fn project_of(&self, draft_id: Uuid) -> Result<String, WorkbenchError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT project_id FROM drafts WHERE draft_id = ?1 AND is_deleted = 0")
                .bind(draft_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(p,)| p).ok_or(WorkbenchError::NotFound)
    }

    /// Fetch one draft, ignoring soft-deleted rows.
    async fn fetch(&self, draft_id: Uuid) -> Result<Option<Draft>, WorkbenchError> {
        let row: Option<DraftRow> = sqlx::query_as(
            "SELECT draft_id, owner_id, project_id, title, content, runtime_env, status, \
             locked_by, lock_expires_at, is_deleted, created_at, updated_at \
             FROM drafts WHERE draft_id = ?1 AND is_deleted = 0",
        )
        .bind(draft_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(DraftRow::into_draft).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct DraftRow {
    draft_id: String,
    owner_id: Option<String>,
    project_id: String,
    title: String,
    content: String,
    runtime_env: Option<String>,
    status: String,
    locked_by: Option<String>,
    lock_expires_at: Option<String>,
    is_deleted: i64,
    created_at: String,
    updated_at: String,
}

impl DraftRow {
    fn into_draft(self) -> Result<Draft, WorkbenchError> {
        let bad = |what: &str| WorkbenchError::Store(format!("corrupt draft row: {what}"));
        Ok(Draft {
            draft_id: Uuid::parse_str(&self.draft_id).map_err(|_| bad("draft_id"))?,
            owner_id: self
                .owner_id
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()
                .map_err(|_| bad("owner_id"))?,
            project_id: self.project_id,
            title: self.title,
            content: serde_json::from_str(&self.content).map_err(|_| bad("content"))?,
            runtime_env: self.runtime_env,
            status: DraftStatus::parse(&self.status).ok_or_else(|| bad("status"))?,
            locked_by: self
                .locked_by
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()
                .map_err(|_| bad("locked_by"))?,
            lock_expires_at: self
                .lock_expires_at
                .as_deref()
                .map(parse_ts)
                .transpose()
                .map_err(|_| bad("lock_expires_at"))?,
            is_deleted: self.is_deleted != 0,
            created_at: parse_ts(&self.created_at).map_err(|_| bad("created_at"))?,
            updated_at: parse_ts(&self.updated_at).map_err(|_| bad("updated_at"))?,
        })
    }
}
