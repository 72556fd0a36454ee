//! Identity resolution: credential verification and principal construction.
//!
//! The resolver validates a bearer credential against the identity
//! provider's published signing keys, then flattens the subject's group
//! memberships into project identifiers and roles via the authorization
//! [`Directory`]. Principals are re-derived on every request; there is no
//! principal cache, so an upstream revocation takes effect within one
//! request.

mod directory;
mod token;

use std::collections::BTreeSet;

use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub use directory::{Directory, DirectoryError, GroupAccess, SqlDirectory, StaticDirectory};
pub use token::{decode_verifying_key, Claims, KeySet, TokenSigner, TokenVerifier};

/// Roles a principal may carry. `Manager` is always derived from group
/// mappings, never self-claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// Baseline role for anyone with project access.
    Developer,
    /// May safe-view locked drafts and approve/reject pending ones.
    Manager,
}

impl Role {
    /// Stable label stored in `group_mappings.role_name`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Developer => "DEVELOPER",
            Self::Manager => "MANAGER",
        }
    }

    /// Parse a stored role label. Unknown labels map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEVELOPER" => Some(Self::Developer),
            "MANAGER" => Some(Self::Manager),
            _ => None,
        }
    }
}

/// An authenticated caller, immutable for the duration of one request.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Stable subject identifier from the identity provider.
    pub user_id: Uuid,
    /// Email claim.
    pub email: String,
    /// Display name claim, when present.
    pub name: Option<String>,
    /// Raw group identifiers from the credential.
    pub groups: Vec<Uuid>,
    /// Project identifiers derived from groups, deduplicated.
    pub projects: BTreeSet<String>,
    /// Derived role set.
    pub roles: BTreeSet<Role>,
}

impl Principal {
    /// Whether the principal may act on the given project.
    pub fn has_project(&self, project_id: &str) -> bool {
        self.projects.contains(project_id)
    }

    /// Whether the principal carries the manager role.
    pub fn is_manager(&self) -> bool {
        self.roles.contains(&Role::Manager)
    }
}

/// Categorized identity failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credential was presented.
    #[error("missing credential")]
    MissingCredential,
    /// The credential could not be parsed.
    #[error("malformed credential")]
    MalformedCredential,
    /// Signature verification failed.
    #[error("credential signature invalid")]
    SignatureInvalid,
    /// The credential is past its expiry.
    #[error("credential expired")]
    Expired,
    /// The credential verified but names no usable subject.
    #[error("unknown subject")]
    UnknownSubject,
    /// The authorization directory could not be queried.
    #[error("authorization directory unavailable: {0}")]
    Directory(String),
}

/// Resolves bearer credentials into [`Principal`]s.
pub struct IdentityResolver {
    verifier: TokenVerifier,
    directory: std::sync::Arc<dyn Directory>,
    /// Pool for the best-effort login upsert; absent in unit tests.
    login_pool: Option<SqlitePool>,
}

impl IdentityResolver {
    /// Build a resolver from a verifier and an authorization directory.
    pub fn new(verifier: TokenVerifier, directory: std::sync::Arc<dyn Directory>) -> Self {
        Self {
            verifier,
            directory,
            login_pool: None,
        }
    }

    /// Enable the best-effort user upsert on successful resolution.
    pub fn with_login_recording(mut self, pool: SqlitePool) -> Self {
        self.login_pool = Some(pool);
        self
    }

    /// Validate a bearer credential and derive the caller's principal.
    ///
    /// # Errors
    ///
    /// Returns a categorized [`AuthError`]; the caller maps it to an HTTP
    /// status without inspecting further.
    pub async fn resolve(&self, credential: &str) -> Result<Principal, AuthError> {
        if credential.trim().is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let claims = self.verifier.verify(credential).await?;

        let sub = claims.sub;
        if sub.is_nil() {
            return Err(AuthError::UnknownSubject);
        }

        let access = self
            .directory
            .resolve_access(&claims.groups)
            .await
            .map_err(|e| AuthError::Directory(e.to_string()))?;

        let principal = Principal {
            user_id: sub,
            email: claims.email.clone(),
            name: claims.name.clone(),
            groups: claims.groups.clone(),
            projects: access.projects,
            roles: access.roles,
        };

        debug!(
            user = %principal.user_id,
            projects = principal.projects.len(),
            manager = principal.is_manager(),
            "principal resolved"
        );

        if let Some(pool) = &self.login_pool {
            crate::db::record_login(
                pool,
                principal.user_id,
                &principal.email,
                principal.name.as_deref(),
            )
            .await;
        }

        Ok(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn resolver_with(access: GroupAccess) -> (IdentityResolver, TokenSigner) {
        let signer = TokenSigner::ephemeral("https://idp.test/", "armitage");
        let verifier = signer.verifier();
        let group = Uuid::new_v4();
        let directory = StaticDirectory::new([(group, access)]);
        let resolver = IdentityResolver::new(verifier, Arc::new(directory));
        (resolver, signer.with_groups(vec![group]))
    }

    fn dev_access(project: &str) -> GroupAccess {
        GroupAccess {
            projects: [project.to_owned()].into(),
            roles: [Role::Developer].into(),
        }
    }

    #[tokio::test]
    async fn resolves_projects_and_roles() {
        let (resolver, signer) = resolver_with(dev_access("proj-a"));
        let token = signer.issue(Uuid::new_v4(), "dev@example.com", None);
        let principal = resolver.resolve(&token).await.expect("resolve");
        assert!(principal.has_project("proj-a"));
        assert!(!principal.is_manager());
    }

    #[tokio::test]
    async fn empty_credential_is_missing() {
        let (resolver, _) = resolver_with(dev_access("p"));
        assert!(matches!(
            resolver.resolve("  ").await,
            Err(AuthError::MissingCredential)
        ));
    }

    #[tokio::test]
    async fn nil_subject_is_unknown() {
        let (resolver, signer) = resolver_with(dev_access("p"));
        let token = signer.issue(Uuid::nil(), "ghost@example.com", None);
        assert!(matches!(
            resolver.resolve(&token).await,
            Err(AuthError::UnknownSubject)
        ));
    }

    #[tokio::test]
    async fn unmapped_groups_yield_empty_access() {
        let signer = TokenSigner::ephemeral("https://idp.test/", "armitage");
        let verifier = signer.verifier();
        let resolver = IdentityResolver::new(verifier, Arc::new(StaticDirectory::default()));
        let token = signer
            .with_groups(vec![Uuid::new_v4()])
            .issue(Uuid::new_v4(), "dev@example.com", None);
        let principal = resolver.resolve(&token).await.expect("resolve");
        assert!(principal.projects.is_empty());
        assert!(principal.roles.is_empty());
    }
}
