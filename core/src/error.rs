//! Caller-facing error taxonomy.
//!
//! Every coordinator and lifecycle operation returns [`RegistrationError`].
//! Component errors convert into it at the boundary.

use crate::entity::EntityType;
use crate::repository::RepositoryError;
use thiserror::Error;

/// Which invariant-protecting check rejected a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// No free slot left
    CapacityExceeded,
    /// The user already holds a confirmed registration
    DuplicateRegistration,
    /// A concurrent writer changed the record first
    VersionMismatch,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CapacityExceeded => write!(f, "capacity exceeded"),
            Self::DuplicateRegistration => write!(f, "duplicate registration"),
            Self::VersionMismatch => write!(f, "version mismatch"),
        }
    }
}

/// Errors returned to callers of the registration system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Malformed input, rejected before touching the ledger.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Role or identity does not permit the operation.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Missing event, user or registration.
    #[error("{0} not found: {1}")]
    NotFound(EntityType, String),

    /// Rejected to preserve an invariant.
    #[error("Conflict: {0}")]
    Conflict(ConflictKind),

    /// Retries exhausted under contention.
    #[error("Temporarily unavailable after {attempts} attempts")]
    TemporaryUnavailable {
        /// Number of attempts made
        attempts: u32,
    },

    /// Unexpected persistence failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistrationError {
    /// Whether another attempt may succeed without the caller changing anything.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(ConflictKind::VersionMismatch))
    }

    /// Whether the event was full
    #[must_use]
    pub const fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::Conflict(ConflictKind::CapacityExceeded))
    }

    /// Whether the user was already registered
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Conflict(ConflictKind::DuplicateRegistration))
    }

    /// Shorthand for a missing event
    #[must_use]
    pub fn event_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound(EntityType::Event, id.to_string())
    }

    /// Shorthand for a missing user account
    #[must_use]
    pub fn user_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound(EntityType::User, id.to_string())
    }
}

impl From<RepositoryError> for RegistrationError {
    fn from(error: RepositoryError) -> Self {
        Self::Internal(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_predicates() {
        assert!(RegistrationError::Conflict(ConflictKind::CapacityExceeded).is_capacity_exceeded());
        assert!(RegistrationError::Conflict(ConflictKind::DuplicateRegistration).is_duplicate());
        assert!(RegistrationError::Conflict(ConflictKind::VersionMismatch).is_retryable());
        assert!(!RegistrationError::Validation("x".into()).is_retryable());
    }

    #[test]
    fn display_messages() {
        let err = RegistrationError::event_not_found("42");
        assert_eq!(err.to_string(), "event not found: 42");

        let err = RegistrationError::TemporaryUnavailable { attempts: 3 };
        assert_eq!(err.to_string(), "Temporarily unavailable after 3 attempts");
    }

    #[test]
    fn repository_errors_are_internal() {
        let err: RegistrationError = RepositoryError::Unavailable("down".into()).into();
        assert!(matches!(err, RegistrationError::Internal(_)));
    }
}
