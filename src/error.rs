//! Categorized error values crossing component boundaries.
//!
//! Each pipeline step converts collaborator failures into exactly one
//! [`ErrorKind`] before continuing. Only categorized errors reach the HTTP
//! edge; raw upstream messages never do. The category string itself is safe
//! to log and to record in telemetry.

use std::fmt;

/// The closed set of failure categories understood by the HTTP edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No credential was presented.
    AuthMissing,
    /// A credential was presented but failed verification.
    AuthInvalid,
    /// The principal is authenticated but not authorized for the resource.
    Forbidden,
    /// The requested entity does not exist.
    NotFound,
    /// The request payload failed validation.
    ValidationFailed,
    /// The daily budget would be exceeded.
    BudgetExceeded,
    /// Another principal holds a live draft lock.
    LockConflict,
    /// The operation conflicts with current entity state.
    Conflict,
    /// Transient upstream failure or open circuit breaker; retriable.
    Unavailable,
    /// Non-retryable upstream failure.
    Upstream,
    /// The gateway is misconfigured for this request (e.g. missing secret).
    ConfigurationError,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorKind {
    /// Stable snake_case label used in logs and telemetry outcome fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthMissing => "auth_missing",
            Self::AuthInvalid => "auth_invalid",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::ValidationFailed => "validation_failed",
            Self::BudgetExceeded => "budget_exceeded",
            Self::LockConflict => "lock_conflict",
            Self::Conflict => "conflict",
            Self::Unavailable => "unavailable",
            Self::Upstream => "upstream",
            Self::ConfigurationError => "configuration_error",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A categorized failure with a human-readable detail string.
///
/// The detail is what ends up in the HTTP error envelope; it must never
/// contain secret material, PII, or raw upstream bodies.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{detail}")]
pub struct GovernanceError {
    /// Failure category; drives the HTTP status code.
    pub kind: ErrorKind,
    /// Informational message for the caller.
    pub detail: String,
}

impl GovernanceError {
    /// Build an error from a category and detail message.
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Shorthand for a [`ErrorKind::Forbidden`] error.
    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, detail)
    }

    /// Shorthand for a [`ErrorKind::ValidationFailed`] error.
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationFailed, detail)
    }

    /// Shorthand for an [`ErrorKind::Internal`] error.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }
}
