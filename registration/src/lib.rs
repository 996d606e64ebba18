//! # EventFlow
//!
//! Capacity-safe event registration with consistent mirrors and resumable
//! change feeds.
//!
//! ## Components
//!
//! ```text
//! request ──> RegistrationCoordinator ──> CapacityLedger        (per-event lock, leases)
//!                     │                        │
//!                     └──> ConsistencySynchronizer ──> Repository (row, user mirror, event mirror)
//!                                  │
//!                                  └──> ChangeNotifier ──> observers
//!
//! EventLifecycleManager reuses the same ledger, cancellation path and notifier.
//! ```
//!
//! - [`ledger`]: the single source of truth for "is there room"
//! - [`coordinator`]: register and cancel with bounded retry
//! - [`synchronizer`]: mirror writes, rollback, reconciliation
//! - [`notifier`]: versioned, filtered, resumable fan-out
//! - [`lifecycle`]: administrative create/update/delete of events and accounts
//! - [`app`]: wiring, observer connection, background jobs
//!
//! ## Example
//!
//! ```no_run
//! use eventflow::{Config, EventFlowApp};
//! use eventflow_core::environment::SystemClock;
//! use eventflow_runtime::InMemoryRepository;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), eventflow_core::RegistrationError> {
//! let app = EventFlowApp::new(
//!     Config::default(),
//!     Arc::new(InMemoryRepository::new()),
//!     Arc::new(SystemClock),
//! );
//! let admin = app.seed_demo().await?;
//! let events = app.lifecycle().list_events().await?;
//! assert!(!events.is_empty());
//! # let _ = admin;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod config;
pub mod coordinator;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod notifier;
pub mod synchronizer;

pub use app::{EventFlowApp, FeedSnapshot, ObserverConnection};
pub use config::{Config, ConfigError};
pub use coordinator::{
    CancelOutcome, CancellationReceipt, RegistrationConfirmation, RegistrationCoordinator,
};
pub use ledger::{
    CapacityLedger, CommitOutcome, Eviction, LedgerError, LedgerSnapshot, ReleaseOutcome,
    Reservation, ReserveOutcome, SlotBook, SlotGuard,
};
pub use lifecycle::{
    EventDeletion, EventDraft, EventLifecycleManager, EventPatch, EventUpdate, UserDraft,
    UserRemoval,
};
pub use notifier::{ChangeNotifier, NotifierError, ResumeFrom, Subscription};
pub use synchronizer::{ConsistencySynchronizer, MirrorReceipt, ReconcileReport, SyncError};
