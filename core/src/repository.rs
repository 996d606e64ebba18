//! Persistence contract consumed from the storage collaborator.
//!
//! The repository is a keyed record store with one concurrency primitive: a
//! versioned compare-and-swap `write`. Everything the registration system
//! builds on top (per-event serialization, mirror consistency, reconciliation)
//! assumes nothing more than this.
//!
//! # Example
//!
//! ```no_run
//! use eventflow_core::repository::{ExpectedVersion, Mutation, Repository, RepositoryError, WriteOutcome};
//! use eventflow_core::{Entity, EntityKey, Event};
//!
//! async fn rename<R: Repository + ?Sized>(repo: &R, key: EntityKey) -> Result<(), RepositoryError> {
//!     let Some(Entity::Event(mut event)) = repo.read(key).await? else {
//!         return Ok(());
//!     };
//!     let expected = ExpectedVersion::Exact(event.version);
//!     event.title = "Renamed".to_string();
//!     match repo.write(key, Mutation::Put(Entity::Event(event)), expected).await? {
//!         WriteOutcome::Committed(_) => Ok(()),
//!         WriteOutcome::VersionMismatch { .. } => Ok(()), // someone else won; re-read and retry
//!     }
//! }
//! ```

use crate::entity::{Entity, EntityKey, EntityType};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by a repository implementation.
///
/// A version mismatch is *not* an error: it is reported through
/// [`WriteOutcome::VersionMismatch`] so callers can retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// Storage backend unreachable or failed.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Entity stored under a key does not match the key.
    #[error("Entity does not match key {key}")]
    KeyMismatch {
        /// The key the write targeted
        key: EntityKey,
    },

    /// Stored data could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// A write to apply to one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    /// Insert or replace the record
    Put(Entity),
    /// Remove the record
    Delete,
}

/// Precondition of a versioned write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The key must not exist
    Absent,
    /// The stored record must carry exactly this version
    Exact(u64),
    /// No precondition
    Any,
}

impl ExpectedVersion {
    /// Precondition matching a record previously read (or its absence).
    #[must_use]
    pub const fn of(version: Option<u64>) -> Self {
        match version {
            Some(v) => Self::Exact(v),
            None => Self::Absent,
        }
    }

    /// Whether a record currently at `current` satisfies the precondition.
    #[must_use]
    pub const fn matches(&self, current: Option<u64>) -> bool {
        match (self, current) {
            (Self::Any, _) | (Self::Absent, None) => true,
            (Self::Exact(expected), Some(actual)) => *expected == actual,
            _ => false,
        }
    }
}

/// Result of a versioned write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied. Carries the new version (`0` after a delete).
    Committed(u64),
    /// The precondition failed; nothing was written.
    VersionMismatch {
        /// Version currently stored, `None` if the key is absent
        current: Option<u64>,
    },
}

impl WriteOutcome {
    /// Whether the write was applied
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

/// Keyed record store with optimistic concurrency.
///
/// Implementations assign `version = previous + 1` (or `1` for a fresh key)
/// on every committed `Put` and store the record with that version, whatever
/// version the caller left on the entity.
///
/// The methods return boxed futures so the trait stays object-safe and can be
/// shared as `Arc<dyn Repository>`.
pub trait Repository: Send + Sync {
    /// Read the record stored under `key`, `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the backend fails.
    fn read(
        &self,
        key: EntityKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Entity>, RepositoryError>> + Send + '_>>;

    /// Apply `mutation` to `key` if the stored version satisfies `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the backend fails or a `Put` carries an
    /// entity whose key differs from `key`.
    fn write(
        &self,
        key: EntityKey,
        mutation: Mutation,
        expected: ExpectedVersion,
    ) -> Pin<Box<dyn Future<Output = Result<WriteOutcome, RepositoryError>> + Send + '_>>;

    /// List every record of one type.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the backend fails.
    fn list(
        &self,
        entity_type: EntityType,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Entity>, RepositoryError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_version_matching() {
        assert!(ExpectedVersion::Absent.matches(None));
        assert!(!ExpectedVersion::Absent.matches(Some(1)));
        assert!(ExpectedVersion::Exact(3).matches(Some(3)));
        assert!(!ExpectedVersion::Exact(3).matches(Some(4)));
        assert!(!ExpectedVersion::Exact(3).matches(None));
        assert!(ExpectedVersion::Any.matches(None));
        assert!(ExpectedVersion::Any.matches(Some(9)));
    }

    #[test]
    fn expected_version_of_read() {
        assert_eq!(ExpectedVersion::of(None), ExpectedVersion::Absent);
        assert_eq!(ExpectedVersion::of(Some(2)), ExpectedVersion::Exact(2));
    }

    #[test]
    fn repository_error_display() {
        let err = RepositoryError::Unavailable("connection reset".to_string());
        assert_eq!(err.to_string(), "Storage unavailable: connection reset");
    }
}
