//! # EventFlow Core
//!
//! Core types and contracts for the EventFlow registration system.
//!
//! This crate holds everything the concurrency-critical components share but
//! nothing that performs I/O:
//!
//! - **Identifiers**: strongly typed ids for events, users, reservations and
//!   observer sessions
//! - **Records**: the `Event`, `UserAccount` and `Registration` entities with
//!   their optimistic-concurrency versions
//! - **Repository**: the persistence contract (`read` / versioned `write` / `list`)
//! - **Identity**: the authentication contract producing an explicit [`Caller`]
//! - **Changes**: versioned change-feed payloads and visibility filters
//! - **Errors**: the caller-facing error taxonomy
//!
//! ## Invariants carried by the data model
//!
//! ```text
//! |Event.attendee_ids| <= Event.capacity
//! Event.attendee_ids == { user | Registration(event, user).status == Confirmed }
//! UserAccount.registered_events == { event | Registration(event, user).status == Confirmed }
//! at most one Registration row per (event, user)
//! ```
//!
//! The types here cannot enforce the cross-entity invariants on their own; the
//! ledger and synchronizer in the `eventflow` crate do.

// Re-export commonly used types
pub use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

pub mod change;
pub mod entity;
pub mod error;
pub mod identity;
pub mod repository;
pub mod types;

pub use change::{
    ChangeDraft, ChangePayload, EventSummary, RegistrationSummary, UserSummary, VersionedChange,
    Visibility,
};
pub use entity::{
    CancelReason, Entity, EntityKey, EntityType, Event, Record, Registration, RegistrationStatus,
    UserAccount,
};
pub use error::{ConflictKind, RegistrationError};
pub use identity::{IdentityProvider, Unauthenticated};
pub use repository::{ExpectedVersion, Mutation, Repository, RepositoryError, WriteOutcome};
pub use types::{Caller, Category, EventId, ReservationId, Role, SessionId, SubscriptionId, UserId};

/// Environment module - injectable dependencies
///
/// All time-dependent decisions (lease expiry, audit timestamps) read the clock
/// through this trait so tests can control time.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use eventflow_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
