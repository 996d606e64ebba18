//! Registration coordinator: the participant-facing register/cancel path.
//!
//! One registration attempt runs entirely under the event's ledger guard:
//!
//! ```text
//! acquire(event) ──> try_reserve_slot ──> record_registration ──> commit ──> publish
//!       │                   │                     │  (bounded by the lease)
//!   Contended          Capacity/Duplicate          └─ failure ──> rollback_registration
//!   (retried)          (returned as is)                           ├─ ok:  abort reservation
//!                                                                 └─ err: retain slot for reconcile
//! ```
//!
//! Contention (lock timeout, lost optimistic writes, elapsed lease) is retried
//! with bounded exponential backoff; once the attempts run out the caller gets
//! [`RegistrationError::TemporaryUnavailable`]. Changes are published while
//! the guard is still held, so observers see each event's changes in commit
//! order.

use crate::ledger::{
    CapacityLedger, CommitOutcome, LedgerError, Reservation, ReserveOutcome, SlotGuard,
};
use crate::metrics::{self as business, RegistrationOutcome};
use crate::notifier::ChangeNotifier;
use crate::synchronizer::ConsistencySynchronizer;
use eventflow_core::{
    Caller, CancelReason, ConflictKind, Entity, EntityKey, EventId, EventSummary, Registration,
    RegistrationError, RegistrationSummary, Repository, UserId,
};
use eventflow_runtime::retry::{RetryError, RetryPolicy, retry_with_predicate};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Proof of a committed registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistrationConfirmation {
    /// Event
    pub event_id: EventId,
    /// Participant
    pub user_id: UserId,
    /// Per-event commit sequence number
    pub committed_at: u64,
}

/// Details of a committed cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CancellationReceipt {
    /// Event
    pub event_id: EventId,
    /// Participant
    pub user_id: UserId,
    /// Why the registration was cancelled
    pub reason: CancelReason,
    /// Free slots after the cancellation
    pub capacity_remaining: u32,
}

/// Result of a cancellation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The registration was cancelled
    Cancelled(CancellationReceipt),
    /// There was no confirmed registration; nothing changed
    NotRegistered,
}

#[derive(Error, Debug)]
enum AttemptError {
    #[error("ledger entry contended")]
    Contended,
    #[error("mirror write outlived the reservation lease")]
    LeaseElapsed,
    #[error(transparent)]
    Rejected(RegistrationError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Contended | Self::LeaseElapsed => true,
            Self::Rejected(e) => e.is_retryable(),
        }
    }
}

impl From<LedgerError> for AttemptError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::Contended(_) => Self::Contended,
            other => Self::Rejected(other.into()),
        }
    }
}

/// Validates and commits registrations and cancellations.
pub struct RegistrationCoordinator {
    repository: Arc<dyn Repository>,
    ledger: Arc<CapacityLedger>,
    synchronizer: Arc<ConsistencySynchronizer>,
    notifier: ChangeNotifier,
    retry: RetryPolicy,
    lease_ttl: Duration,
}

impl std::fmt::Debug for RegistrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationCoordinator")
            .field("retry", &self.retry)
            .field("lease_ttl", &self.lease_ttl)
            .finish_non_exhaustive()
    }
}

impl RegistrationCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        repository: Arc<dyn Repository>,
        ledger: Arc<CapacityLedger>,
        synchronizer: Arc<ConsistencySynchronizer>,
        notifier: ChangeNotifier,
        retry: RetryPolicy,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            repository,
            ledger,
            synchronizer,
            notifier,
            retry,
            lease_ttl,
        }
    }

    /// Register the calling participant for an event.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::Unauthorized`] if the caller is not a participant
    /// - [`RegistrationError::NotFound`] if the event or the caller's account is missing
    /// - [`RegistrationError::Conflict`] with `DuplicateRegistration` or `CapacityExceeded`
    /// - [`RegistrationError::TemporaryUnavailable`] once contention outlasts the retry budget
    /// - [`RegistrationError::Internal`] on storage failure
    #[tracing::instrument(skip(self), fields(user_id = %caller.user_id))]
    pub async fn request_registration(
        &self,
        caller: &Caller,
        event_id: EventId,
    ) -> Result<RegistrationConfirmation, RegistrationError> {
        let started = Instant::now();
        let result = self.register(caller, event_id).await;

        let outcome = match &result {
            Ok(_) => RegistrationOutcome::Confirmed,
            Err(e) if e.is_capacity_exceeded() => RegistrationOutcome::CapacityExceeded,
            Err(e) if e.is_duplicate() => RegistrationOutcome::Duplicate,
            Err(RegistrationError::TemporaryUnavailable { .. }) => RegistrationOutcome::Unavailable,
            Err(_) => RegistrationOutcome::Rejected,
        };
        business::record_registration(outcome, started.elapsed());
        result
    }

    async fn register(
        &self,
        caller: &Caller,
        event_id: EventId,
    ) -> Result<RegistrationConfirmation, RegistrationError> {
        if caller.is_admin() {
            return Err(RegistrationError::Unauthorized(
                "only participants can register for events".to_string(),
            ));
        }
        let user_id = caller.user_id;
        if self.repository.read(EntityKey::User(user_id)).await?.is_none() {
            return Err(RegistrationError::user_not_found(user_id));
        }

        retry_with_predicate(
            &self.retry,
            |_| self.attempt(event_id, user_id),
            AttemptError::is_retryable,
        )
        .await
        .map_err(|e| match e {
            RetryError::Exhausted { attempts, .. } => {
                RegistrationError::TemporaryUnavailable { attempts }
            }
            RetryError::Permanent(AttemptError::Rejected(e)) => e,
            RetryError::Permanent(_) => RegistrationError::TemporaryUnavailable { attempts: 1 },
        })
    }

    async fn attempt(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<RegistrationConfirmation, AttemptError> {
        let mut guard = self.ledger.acquire(event_id).await?;

        let reservation = match guard.try_reserve_slot(user_id)? {
            ReserveOutcome::Reserved(reservation) => reservation,
            ReserveOutcome::CapacityExceeded => {
                return Err(AttemptError::Rejected(RegistrationError::Conflict(
                    ConflictKind::CapacityExceeded,
                )));
            }
            ReserveOutcome::DuplicateRegistration => {
                return Err(AttemptError::Rejected(RegistrationError::Conflict(
                    ConflictKind::DuplicateRegistration,
                )));
            }
        };

        let mirrored = tokio::time::timeout(
            self.lease_ttl,
            self.synchronizer
                .record_registration(event_id, user_id, reservation.commit_seq),
        )
        .await;

        let failure = match mirrored {
            Ok(Ok(receipt)) => match guard.commit(&reservation) {
                CommitOutcome::Committed { commit_seq } => {
                    self.notifier.publish(receipt.changes);
                    business::record_capacity_remaining(event_id, guard.book().remaining());
                    info!(%event_id, %user_id, commit_seq, "Registration confirmed");
                    return Ok(RegistrationConfirmation {
                        event_id,
                        user_id,
                        committed_at: commit_seq,
                    });
                }
                CommitOutcome::LeaseExpired => {
                    self.compensate(&mut guard, &reservation, false).await;
                    AttemptError::LeaseElapsed
                }
                CommitOutcome::CapacityExceeded => {
                    self.compensate(&mut guard, &reservation, false).await;
                    AttemptError::Rejected(RegistrationError::Conflict(
                        ConflictKind::CapacityExceeded,
                    ))
                }
            },
            Ok(Err(e)) => {
                warn!(%event_id, %user_id, error = %e, "Mirror write failed; rolling back");
                self.compensate(&mut guard, &reservation, true).await;
                AttemptError::Rejected(e.into())
            }
            Err(_) => {
                warn!(
                    %event_id,
                    %user_id,
                    "Mirror write exceeded the reservation lease; rolling back"
                );
                self.compensate(&mut guard, &reservation, true).await;
                AttemptError::LeaseElapsed
            }
        };
        Err(failure)
    }

    /// Undo a partly recorded registration.
    ///
    /// When the rollback itself fails the registration row may still read as
    /// confirmed, so the slot stays occupied (if `retain` allows it) until
    /// reconciliation settles the records.
    async fn compensate(&self, guard: &mut SlotGuard, reservation: &Reservation, retain: bool) {
        let (event_id, user_id) = (reservation.event_id, reservation.user_id);
        match self
            .synchronizer
            .rollback_registration(event_id, user_id, reservation.commit_seq)
            .await
        {
            Ok(receipt) => {
                guard.abort(reservation);
                self.notifier.publish(receipt.changes);
            }
            Err(e) => {
                error!(
                    %event_id,
                    %user_id,
                    error = %e,
                    "Rollback failed; slot held until reconciliation"
                );
                if retain {
                    guard.retain(reservation);
                } else {
                    guard.abort(reservation);
                }
            }
        }
    }

    /// Cancel a registration.
    ///
    /// Participants may cancel their own registration; administrators may
    /// cancel anyone's. Cancelling something that is not confirmed returns
    /// [`CancelOutcome::NotRegistered`] and changes nothing.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::Unauthorized`] when a participant targets someone else
    /// - [`RegistrationError::NotFound`] if the event does not exist
    /// - [`RegistrationError::TemporaryUnavailable`] if the event stays contended
    /// - [`RegistrationError::Internal`] / [`RegistrationError::Conflict`] if the write fails
    #[tracing::instrument(skip(self), fields(caller = %caller.user_id))]
    pub async fn cancel_registration(
        &self,
        caller: &Caller,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<CancelOutcome, RegistrationError> {
        let reason = if caller.user_id == user_id {
            CancelReason::Participant
        } else if caller.is_admin() {
            CancelReason::Administrator
        } else {
            return Err(RegistrationError::Unauthorized(
                "participants can only cancel their own registrations".to_string(),
            ));
        };

        let mut guard = self.lock(event_id).await?;
        let row = self
            .repository
            .read(EntityKey::Registration(event_id, user_id))
            .await?;
        if !matches!(&row, Some(Entity::Registration(row)) if row.is_confirmed()) {
            return Ok(CancelOutcome::NotRegistered);
        }

        self.cancel_under_guard(&mut guard, user_id, reason)
            .await
            .map(CancelOutcome::Cancelled)
    }

    pub(crate) async fn lock(&self, event_id: EventId) -> Result<SlotGuard, RegistrationError> {
        self.ledger
            .acquire_with_retry(event_id, &self.retry)
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, .. } => {
                    RegistrationError::TemporaryUnavailable { attempts }
                }
                RetryError::Permanent(e) => e.into(),
            })
    }

    /// Cancel a confirmed registration of the guarded event and free its slot.
    ///
    /// The registration row decides: if the mirror write fails but the row
    /// already reads as cancelled, the slot is released anyway.
    pub(crate) async fn cancel_under_guard(
        &self,
        guard: &mut SlotGuard,
        user_id: UserId,
        reason: CancelReason,
    ) -> Result<CancellationReceipt, RegistrationError> {
        let event_id = guard.event_id();
        match self
            .synchronizer
            .record_cancellation(event_id, user_id, reason)
            .await
        {
            Ok(receipt) => {
                guard.release_slot(user_id);
                self.notifier.publish(receipt.changes);
                let capacity_remaining = guard.book().remaining();
                business::record_cancellation(reason);
                business::record_capacity_remaining(event_id, capacity_remaining);
                info!(%event_id, %user_id, %reason, "Registration cancelled");
                Ok(CancellationReceipt {
                    event_id,
                    user_id,
                    reason,
                    capacity_remaining,
                })
            }
            Err(e) => {
                let row = self
                    .repository
                    .read(EntityKey::Registration(event_id, user_id))
                    .await
                    .ok()
                    .flatten();
                if !matches!(&row, Some(Entity::Registration(row)) if row.is_confirmed()) {
                    guard.release_slot(user_id);
                }
                error!(%event_id, %user_id, error = %e, "Cancellation mirror write failed");
                Err(e.into())
            }
        }
    }

    /// Events the caller holds a confirmed registration for, newest first.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::NotFound`] if the caller has no account.
    pub async fn registered_events(
        &self,
        caller: &Caller,
    ) -> Result<Vec<EventSummary>, RegistrationError> {
        let Some(Entity::User(user)) = self.repository.read(EntityKey::User(caller.user_id)).await?
        else {
            return Err(RegistrationError::user_not_found(caller.user_id));
        };

        let mut events = Vec::with_capacity(user.registered_events.len());
        for event_id in &user.registered_events {
            if let Some(Entity::Event(event)) =
                self.repository.read(EntityKey::Event(*event_id)).await?
            {
                events.push(event.summary());
            }
        }
        events.sort_by(|a, b| (b.date, b.time).cmp(&(a.date, a.time)));
        Ok(events)
    }

    /// Registration row of one user for one event.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::Unauthorized`] when a participant asks about someone else.
    pub async fn registration(
        &self,
        caller: &Caller,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<Option<RegistrationSummary>, RegistrationError> {
        if caller.user_id != user_id && !caller.is_admin() {
            return Err(RegistrationError::Unauthorized(
                "participants can only view their own registrations".to_string(),
            ));
        }
        Ok(
            match self
                .repository
                .read(EntityKey::Registration(event_id, user_id))
                .await?
            {
                Some(Entity::Registration(row)) => Some(Registration::summary(&row)),
                _ => None,
            },
        )
    }
}
