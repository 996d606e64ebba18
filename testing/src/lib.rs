//! # EventFlow Testing
//!
//! Testing utilities for the EventFlow registration core.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - [`InMemoryRepository`]: optimistic-concurrency store backed by a `HashMap`
//! - [`FaultyRepository`]: wrapper injecting write failures and delays
//! - [`StaticIdentity`]: identity provider returning a fixed caller
//! - Fixture builders for events and accounts
//!
//! ## Example
//!
//! ```
//! use eventflow_testing::{InMemoryRepository, fixtures};
//!
//! # async fn example() {
//! let repo = InMemoryRepository::new();
//! let event = fixtures::event().capacity(2).build();
//! repo.seed(event.clone().into());
//! assert_eq!(repo.len(), 1);
//! # }
//! ```

use chrono::{DateTime, Duration, Utc};
use eventflow_core::environment::Clock;

pub mod fixtures;
pub mod repository_mocks;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Duration, Utc};
    use eventflow_core::identity::{IdentityProvider, Unauthenticated};
    use eventflow_core::types::Caller;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use eventflow_testing::mocks::FixedClock;
    /// use eventflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to the system
    /// under test and advance the other.
    ///
    /// ```
    /// use eventflow_testing::mocks::ManualClock;
    /// use eventflow_core::environment::Clock;
    /// use chrono::Duration;
    ///
    /// let clock = ManualClock::starting_at_epoch();
    /// let before = clock.now();
    /// clock.advance(Duration::seconds(11));
    /// assert_eq!(clock.now() - before, Duration::seconds(11));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock at the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Create a clock at the same instant as [`test_clock`]
        #[must_use]
        pub fn starting_at_epoch() -> Self {
            Self::new(test_clock().now())
        }

        /// Move the clock forward
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Identity provider returning a fixed answer.
    #[derive(Debug, Clone)]
    pub struct StaticIdentity {
        caller: Option<Caller>,
    }

    impl StaticIdentity {
        /// Always authenticates as `caller`
        #[must_use]
        pub const fn authenticated(caller: Caller) -> Self {
            Self {
                caller: Some(caller),
            }
        }

        /// Never authenticates
        #[must_use]
        pub const fn anonymous() -> Self {
            Self { caller: None }
        }
    }

    impl IdentityProvider for StaticIdentity {
        fn authenticate(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Caller, Unauthenticated>> + Send + '_>> {
            let result = self
                .caller
                .ok_or_else(|| Unauthenticated::new("no session"));
            Box::pin(async move { result })
        }
    }
}

/// Test helpers.
pub mod helpers {
    /// Install a `fmt` subscriber honouring `RUST_LOG`, once per test binary.
    ///
    /// Later calls are no-ops.
    pub fn init_tracing() {
        use tracing_subscriber::EnvFilter;

        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, StaticIdentity, test_clock};
pub use repository_mocks::{FaultyRepository, InMemoryRepository};
