//! Group-to-project authorization directory.
//!
//! Flattens the group identifiers carried by a credential into the set of
//! project identifiers and roles the caller is entitled to. The SQL
//! implementation reads the `group_mappings` table; the static
//! implementation backs unit tests.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use super::Role;

/// Flattened authorization for a set of groups.
#[derive(Debug, Clone, Default)]
pub struct GroupAccess {
    /// Deduplicated project identifiers.
    pub projects: BTreeSet<String>,
    /// Derived roles.
    pub roles: BTreeSet<Role>,
}

/// Directory lookup failures.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The backing store could not be queried.
    #[error("directory query failed: {0}")]
    Query(String),
}

/// Authorization directory collaborator.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolve the union of project grants and roles for the given groups.
    ///
    /// Unknown groups contribute nothing; they are not an error.
    async fn resolve_access(&self, groups: &[Uuid]) -> Result<GroupAccess, DirectoryError>;
}

/// SQL-backed directory reading `group_mappings`.
pub struct SqlDirectory {
    pool: SqlitePool,
}

impl SqlDirectory {
    /// Build a directory over the given pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a group mapping. Used by bootstrap and tests.
    ///
    /// # Errors
    ///
    /// Returns the underlying database error.
    pub async fn put_mapping(
        &self,
        group_id: Uuid,
        role: Role,
        projects: &[&str],
    ) -> Result<(), sqlx::Error> {
        let allowed = serde_json::to_string(projects).unwrap_or_else(|_| "[]".to_owned());
        sqlx::query(
            "INSERT INTO group_mappings (group_id, role_name, allowed_projects) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(group_id) DO UPDATE SET role_name = ?2, allowed_projects = ?3",
        )
        .bind(group_id.to_string())
        .bind(role.as_str())
        .bind(allowed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Directory for SqlDirectory {
    async fn resolve_access(&self, groups: &[Uuid]) -> Result<GroupAccess, DirectoryError> {
        let mut access = GroupAccess::default();
        for group in groups {
            let row: Option<(String, String)> = sqlx::query_as(
                "SELECT role_name, allowed_projects FROM group_mappings WHERE group_id = ?1",
            )
            .bind(group.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DirectoryError::Query(e.to_string()))?;

            let Some((role_name, allowed_json)) = row else {
                continue;
            };
            if let Some(role) = Role::parse(&role_name) {
                access.roles.insert(role);
            }
            let projects: Vec<String> = serde_json::from_str(&allowed_json)
                .map_err(|e| DirectoryError::Query(format!("bad allowed_projects: {e}")))?;
            access.projects.extend(projects);
        }
        Ok(access)
    }
}

/// In-memory directory for tests and single-tenant development setups.
#[derive(Default)]
pub struct StaticDirectory {
    mappings: HashMap<Uuid, GroupAccess>,
}

impl StaticDirectory {
    /// Build from `(group, access)` pairs.
    pub fn new(mappings: impl IntoIterator<Item = (Uuid, GroupAccess)>) -> Self {
        Self {
            mappings: mappings.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn resolve_access(&self, groups: &[Uuid]) -> Result<GroupAccess, DirectoryError> {
        let mut access = GroupAccess::default();
        for group in groups {
            if let Some(grant) = self.mappings.get(group) {
                access.projects.extend(grant.projects.iter().cloned());
                access.roles.extend(grant.roles.iter().copied());
            }
        }
        Ok(access)
    }
}
