//! Capacity ledger: the single source of truth for "is there room".
//!
//! Every event gets one [`SlotBook`] behind its own async mutex. A caller
//! takes the mutex through [`CapacityLedger::acquire`] and holds a
//! [`SlotGuard`] for as long as it needs exclusive access to that event;
//! books of different events never share a lock, so registrations for
//! different events proceed in parallel.
//!
//! # Reservations and leases
//!
//! Taking a slot is two-phase. `try_reserve_slot` places a leased hold that
//! already counts toward occupancy; `commit` turns it into a confirmed
//! attendee. A hold that is never committed goes away in one of three ways:
//!
//! - explicitly, through `abort`
//! - implicitly, when the [`SlotGuard`] that placed it is dropped (the caller
//!   gave up or its future was cancelled)
//! - by lease expiry, for holds detached from their guard
//!
//! ```text
//! occupancy = |confirmed| + |leases|  <=  capacity
//! ```
//!
//! Books are hydrated lazily from the repository the first time an event is
//! touched: capacity and attendees from the `Event` record, commit sequence
//! numbers from the `Registration` rows.

use crate::config::LedgerConfig;
use chrono::{DateTime, Utc};
use eventflow_core::environment::Clock;
use eventflow_core::{
    Entity, EntityKey, EntityType, EventId, Registration, Repository, RepositoryError,
    ReservationId, UserId,
};
use eventflow_runtime::retry::{RetryError, RetryPolicy, retry_with_predicate};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Errors from ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The event does not exist
    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    /// The event is being deleted; no new reservations are accepted
    #[error("Event {0} is closed")]
    Closed(EventId),

    /// The per-event lock could not be taken within the lock timeout
    #[error("Ledger entry for event {0} is contended")]
    Contended(EventId),

    /// Hydration failed
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl LedgerError {
    /// Whether waiting and retrying may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Contended(_))
    }
}

/// A leased hold on one slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    /// Reservation id
    pub id: ReservationId,
    /// Event holding the slot
    pub event_id: EventId,
    /// User the slot is held for
    pub user_id: UserId,
    /// Commit sequence number the registration will carry once committed
    pub commit_seq: u64,
    /// When the lease lapses
    pub expires_at: DateTime<Utc>,
}

/// Result of a reservation attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// A slot is held for the user
    Reserved(Reservation),
    /// No free slot
    CapacityExceeded,
    /// The user is already confirmed or has a hold in flight
    DuplicateRegistration,
}

/// Result of committing a reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The user is now a confirmed attendee
    Committed {
        /// Commit sequence number of the registration
        commit_seq: u64,
    },
    /// The lease lapsed (or was released) before the commit
    LeaseExpired,
    /// The capacity was reduced below the confirmed count while the hold was pending
    CapacityExceeded,
}

/// Result of releasing a confirmed slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The slot was freed
    Released,
    /// The user held no confirmed slot
    NotRegistered,
}

/// A confirmed attendee removed by `resize` or `close`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Eviction {
    /// Evicted user
    pub user_id: UserId,
    /// Commit sequence number of their registration
    pub commit_seq: u64,
}

/// Point-in-time view of one book.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Event
    pub event_id: EventId,
    /// Capacity
    pub capacity: u32,
    /// Confirmed attendees ordered by commit sequence
    pub confirmed: Vec<Eviction>,
    /// Holds in flight
    pub pending: usize,
    /// Free slots
    pub remaining: u32,
}

#[derive(Clone, Debug)]
struct Lease {
    user_id: UserId,
    commit_seq: u64,
    expires_at: DateTime<Utc>,
}

/// Per-event slot accounting.
///
/// Pure bookkeeping; all I/O happens in [`CapacityLedger`].
#[derive(Debug)]
pub struct SlotBook {
    event_id: EventId,
    hydrated: bool,
    capacity: u32,
    confirmed: HashMap<UserId, u64>,
    leases: HashMap<ReservationId, Lease>,
    next_seq: u64,
    closed: bool,
}

impl SlotBook {
    fn empty(event_id: EventId) -> Self {
        Self {
            event_id,
            hydrated: false,
            capacity: 0,
            confirmed: HashMap::new(),
            leases: HashMap::new(),
            next_seq: 1,
            closed: false,
        }
    }

    /// Book with a known capacity and no attendees
    #[must_use]
    pub fn new(event_id: EventId, capacity: u32) -> Self {
        Self {
            hydrated: true,
            capacity,
            ..Self::empty(event_id)
        }
    }

    fn occupancy(&self) -> usize {
        self.confirmed.len() + self.leases.len()
    }

    /// Free slots
    #[must_use]
    pub fn remaining(&self) -> u32 {
        let occupied = u32::try_from(self.occupancy()).unwrap_or(u32::MAX);
        self.capacity.saturating_sub(occupied)
    }

    /// Capacity
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of confirmed attendees
    #[must_use]
    pub fn confirmed_count(&self) -> usize {
        self.confirmed.len()
    }

    /// Number of holds in flight
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.leases.len()
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.leases.len();
        self.leases.retain(|_, lease| lease.expires_at > now);
        let expired = before - self.leases.len();
        if expired > 0 {
            warn!(event_id = %self.event_id, expired, "Released expired reservations");
            crate::metrics::record_leases_expired(expired);
        }
        expired
    }

    /// Place a hold for `user_id` lasting `ttl` from `now`.
    pub fn reserve(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> ReserveOutcome {
        if self.confirmed.contains_key(&user_id)
            || self.leases.values().any(|lease| lease.user_id == user_id)
        {
            return ReserveOutcome::DuplicateRegistration;
        }
        if self.occupancy() >= self.capacity as usize {
            return ReserveOutcome::CapacityExceeded;
        }

        let commit_seq = self.next_seq;
        self.next_seq += 1;
        let reservation = Reservation {
            id: ReservationId::new(),
            event_id: self.event_id,
            user_id,
            commit_seq,
            expires_at: now + ttl,
        };
        self.leases.insert(
            reservation.id,
            Lease {
                user_id,
                commit_seq,
                expires_at: reservation.expires_at,
            },
        );
        ReserveOutcome::Reserved(reservation)
    }

    /// Turn a hold into a confirmed attendee.
    pub fn commit(&mut self, reservation_id: ReservationId, now: DateTime<Utc>) -> CommitOutcome {
        let Some(lease) = self.leases.remove(&reservation_id) else {
            return CommitOutcome::LeaseExpired;
        };
        if lease.expires_at <= now {
            crate::metrics::record_leases_expired(1);
            return CommitOutcome::LeaseExpired;
        }
        if self.confirmed.len() >= self.capacity as usize {
            return CommitOutcome::CapacityExceeded;
        }
        self.confirmed.insert(lease.user_id, lease.commit_seq);
        CommitOutcome::Committed {
            commit_seq: lease.commit_seq,
        }
    }

    /// Drop a hold. Returns `false` if it no longer exists.
    pub fn abort(&mut self, reservation_id: ReservationId) -> bool {
        self.leases.remove(&reservation_id).is_some()
    }

    /// Free a confirmed slot.
    pub fn release(&mut self, user_id: UserId) -> ReleaseOutcome {
        if self.confirmed.remove(&user_id).is_some() {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::NotRegistered
        }
    }

    /// Change the capacity, evicting the most recently committed attendees
    /// until the confirmed count fits.
    pub fn resize(&mut self, capacity: u32) -> Vec<Eviction> {
        self.capacity = capacity;
        let excess = self.confirmed.len().saturating_sub(capacity as usize);
        let evicted: Vec<Eviction> = self
            .by_commit_order()
            .into_iter()
            .rev()
            .take(excess)
            .collect();
        for eviction in &evicted {
            self.confirmed.remove(&eviction.user_id);
        }
        evicted
    }

    /// Stop accepting reservations and release every slot.
    ///
    /// Returns the confirmed attendees in commit order.
    pub fn close(&mut self) -> Vec<Eviction> {
        self.closed = true;
        self.leases.clear();
        let all = self.by_commit_order();
        self.confirmed.clear();
        all
    }

    /// Accept reservations again after an aborted `close`.
    pub const fn reopen(&mut self) {
        self.closed = false;
    }

    /// Whether the book was closed
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Record `user_id` as confirmed without a reservation.
    ///
    /// Uses `commit_seq` when given, otherwise the next sequence number.
    /// Returns the sequence number, or `None` if the user is already confirmed
    /// or the book is full.
    pub fn adopt(&mut self, user_id: UserId, commit_seq: Option<u64>) -> Option<u64> {
        if self.confirmed.contains_key(&user_id) || self.occupancy() >= self.capacity as usize {
            return None;
        }
        let seq = commit_seq.unwrap_or(self.next_seq);
        self.next_seq = self.next_seq.max(seq + 1);
        self.confirmed.insert(user_id, seq);
        Some(seq)
    }

    /// Replace the confirmed set, keeping holds in flight.
    pub fn rebuild(&mut self, capacity: u32, confirmed: impl IntoIterator<Item = (UserId, u64)>) {
        self.capacity = capacity;
        self.confirmed = confirmed.into_iter().collect();
        if let Some(max) = self.confirmed.values().max() {
            self.next_seq = self.next_seq.max(max + 1);
        }
    }

    /// Next commit sequence number to be handed out
    #[must_use]
    pub const fn next_commit_seq(&self) -> u64 {
        self.next_seq
    }

    /// Whether `user_id` is a confirmed attendee
    #[must_use]
    pub fn is_confirmed(&self, user_id: &UserId) -> bool {
        self.confirmed.contains_key(user_id)
    }

    /// Commit sequence number of a confirmed attendee
    #[must_use]
    pub fn commit_seq_of(&self, user_id: &UserId) -> Option<u64> {
        self.confirmed.get(user_id).copied()
    }

    /// Users with a hold in flight
    #[must_use]
    pub fn pending_users(&self) -> HashSet<UserId> {
        self.leases.values().map(|lease| lease.user_id).collect()
    }

    /// Confirmed attendees in commit order
    #[must_use]
    pub fn by_commit_order(&self) -> Vec<Eviction> {
        let mut all: Vec<Eviction> = self
            .confirmed
            .iter()
            .map(|(user_id, commit_seq)| Eviction {
                user_id: *user_id,
                commit_seq: *commit_seq,
            })
            .collect();
        all.sort_by_key(|e| (e.commit_seq, e.user_id));
        all
    }

    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            event_id: self.event_id,
            capacity: self.capacity,
            confirmed: self.by_commit_order(),
            pending: self.leases.len(),
            remaining: self.remaining(),
        }
    }
}

/// Exclusive access to one event's [`SlotBook`].
///
/// Dropping the guard releases the lock and aborts every reservation it
/// placed that was neither committed, aborted nor detached.
pub struct SlotGuard {
    book: OwnedMutexGuard<SlotBook>,
    clock: Arc<dyn Clock>,
    lease_ttl: chrono::Duration,
    attached: Vec<ReservationId>,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("event_id", &self.book.event_id)
            .field("attached", &self.attached)
            .finish_non_exhaustive()
    }
}

impl SlotGuard {
    /// Event this guard locks
    #[must_use]
    pub fn event_id(&self) -> EventId {
        self.book.event_id
    }

    /// Read access to the book
    #[must_use]
    pub fn book(&self) -> &SlotBook {
        &self.book
    }

    /// Place a hold for `user_id`, owned by this guard.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Closed`] if the event is being deleted.
    pub fn try_reserve_slot(&mut self, user_id: UserId) -> Result<ReserveOutcome, LedgerError> {
        if self.book.closed {
            return Err(LedgerError::Closed(self.book.event_id));
        }
        let outcome = self.book.reserve(user_id, self.clock.now(), self.lease_ttl);
        if let ReserveOutcome::Reserved(reservation) = &outcome {
            self.attached.push(reservation.id);
        }
        Ok(outcome)
    }

    /// Commit a hold.
    pub fn commit(&mut self, reservation: &Reservation) -> CommitOutcome {
        self.attached.retain(|id| *id != reservation.id);
        self.book.commit(reservation.id, self.clock.now())
    }

    /// Drop a hold.
    pub fn abort(&mut self, reservation: &Reservation) -> bool {
        self.attached.retain(|id| *id != reservation.id);
        self.book.abort(reservation.id)
    }

    /// Keep a hold alive after this guard is dropped; it then lives until
    /// committed, aborted or expired.
    pub fn detach(&mut self, reservation: &Reservation) {
        self.attached.retain(|id| *id != reservation.id);
    }

    /// Convert a hold into a confirmed slot regardless of its lease.
    ///
    /// Used when a registration could be neither completed nor rolled back:
    /// the slot stays occupied until reconciliation settles the records.
    pub fn retain(&mut self, reservation: &Reservation) {
        self.attached.retain(|id| *id != reservation.id);
        self.book.abort(reservation.id);
        self.book
            .confirmed
            .insert(reservation.user_id, reservation.commit_seq);
    }

    /// Free a confirmed slot.
    pub fn release_slot(&mut self, user_id: UserId) -> ReleaseOutcome {
        self.book.release(user_id)
    }

    /// Change the capacity; see [`SlotBook::resize`].
    pub fn resize(&mut self, capacity: u32) -> Vec<Eviction> {
        self.book.resize(capacity)
    }

    /// Close the book; see [`SlotBook::close`].
    pub fn close(&mut self) -> Vec<Eviction> {
        self.attached.clear();
        self.book.close()
    }

    /// Accept reservations again
    pub fn reopen(&mut self) {
        self.book.reopen();
    }

    /// Record a confirmed attendee; see [`SlotBook::adopt`].
    pub fn adopt(&mut self, user_id: UserId, commit_seq: Option<u64>) -> Option<u64> {
        self.book.adopt(user_id, commit_seq)
    }

    /// Replace the confirmed set; see [`SlotBook::rebuild`].
    pub fn rebuild(&mut self, capacity: u32, confirmed: impl IntoIterator<Item = (UserId, u64)>) {
        self.book.rebuild(capacity, confirmed);
    }

    /// Users with a hold in flight
    #[must_use]
    pub fn pending_users(&self) -> HashSet<UserId> {
        self.book.pending_users()
    }

    /// Point-in-time view
    #[must_use]
    pub fn snapshot(&self) -> LedgerSnapshot {
        self.book.snapshot()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        for reservation_id in self.attached.drain(..) {
            if self.book.abort(reservation_id) {
                debug!(
                    event_id = %self.book.event_id,
                    %reservation_id,
                    "Released uncommitted reservation"
                );
            }
        }
    }
}

/// Per-event capacity ledger.
pub struct CapacityLedger {
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    lease_ttl: chrono::Duration,
    lock_timeout: Duration,
    books: Mutex<HashMap<EventId, Arc<AsyncMutex<SlotBook>>>>,
}

impl CapacityLedger {
    /// Create a ledger over `repository`.
    #[must_use]
    pub fn new(
        repository: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        config: &LedgerConfig,
    ) -> Self {
        Self {
            repository,
            clock,
            lease_ttl: chrono::Duration::from_std(config.lease_ttl())
                .unwrap_or_else(|_| chrono::Duration::seconds(10)),
            lock_timeout: config.lock_timeout(),
            books: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, event_id: EventId) -> Arc<AsyncMutex<SlotBook>> {
        let mut books = self.books.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            books
                .entry(event_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(SlotBook::empty(event_id)))),
        )
    }

    /// Take exclusive access to an event's book, waiting at most the lock
    /// timeout. Expired holds are purged before the guard is returned.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Contended`] if the lock could not be taken in time
    /// - [`LedgerError::EventNotFound`] if the event does not exist
    /// - [`LedgerError::Repository`] if hydration failed
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn acquire(&self, event_id: EventId) -> Result<SlotGuard, LedgerError> {
        let entry = self.entry(event_id);
        let mut book = tokio::time::timeout(self.lock_timeout, entry.lock_owned())
            .await
            .map_err(|_| LedgerError::Contended(event_id))?;

        if !book.hydrated {
            if let Err(error) = self.hydrate(&mut book).await {
                drop(book);
                if matches!(error, LedgerError::EventNotFound(_)) {
                    self.forget(event_id);
                }
                return Err(error);
            }
        }
        book.purge_expired(self.clock.now());

        Ok(SlotGuard {
            book,
            clock: Arc::clone(&self.clock),
            lease_ttl: self.lease_ttl,
            attached: Vec::new(),
        })
    }

    /// [`acquire`](Self::acquire), retrying contention under `policy`.
    ///
    /// # Errors
    ///
    /// As `acquire`; contention is reported once every attempt failed.
    pub async fn acquire_with_retry(
        &self,
        event_id: EventId,
        policy: &RetryPolicy,
    ) -> Result<SlotGuard, RetryError<LedgerError>> {
        retry_with_predicate(policy, |_| self.acquire(event_id), LedgerError::is_retryable).await
    }

    async fn hydrate(&self, book: &mut SlotBook) -> Result<(), LedgerError> {
        let event_id = book.event_id;
        let Some(Entity::Event(event)) = self.repository.read(EntityKey::Event(event_id)).await?
        else {
            return Err(LedgerError::EventNotFound(event_id));
        };

        let rows: Vec<Registration> = self
            .repository
            .list(EntityType::Registration)
            .await?
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::Registration(reg) if reg.event_id == event_id => Some(reg),
                _ => None,
            })
            .collect();
        let seqs: HashMap<UserId, u64> = rows
            .iter()
            .map(|reg| (reg.user_id, reg.committed_at))
            .collect();

        book.capacity = event.capacity;
        book.next_seq = rows.iter().map(|reg| reg.committed_at + 1).max().unwrap_or(1);
        for user_id in &event.attendee_ids {
            let seq = match seqs.get(user_id) {
                Some(seq) => *seq,
                None => {
                    let seq = book.next_seq;
                    book.next_seq += 1;
                    seq
                }
            };
            book.confirmed.insert(*user_id, seq);
        }
        book.hydrated = true;

        debug!(
            %event_id,
            capacity = book.capacity,
            confirmed = book.confirmed.len(),
            "Hydrated ledger entry"
        );
        Ok(())
    }

    /// Place a detached hold: it lives until committed, aborted or expired.
    ///
    /// # Errors
    ///
    /// As [`acquire`](Self::acquire), plus [`LedgerError::Closed`].
    pub async fn try_reserve_slot(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<ReserveOutcome, LedgerError> {
        let mut guard = self.acquire(event_id).await?;
        let outcome = guard.try_reserve_slot(user_id)?;
        if let ReserveOutcome::Reserved(reservation) = &outcome {
            guard.detach(reservation);
        }
        Ok(outcome)
    }

    /// Commit a detached hold.
    ///
    /// # Errors
    ///
    /// As [`acquire`](Self::acquire).
    pub async fn commit_reservation(
        &self,
        reservation: &Reservation,
    ) -> Result<CommitOutcome, LedgerError> {
        let mut guard = self.acquire(reservation.event_id).await?;
        Ok(guard.commit(reservation))
    }

    /// Drop a detached hold. Returns `false` if it had already lapsed.
    ///
    /// # Errors
    ///
    /// As [`acquire`](Self::acquire).
    pub async fn abort_reservation(&self, reservation: &Reservation) -> Result<bool, LedgerError> {
        let mut guard = self.acquire(reservation.event_id).await?;
        Ok(guard.abort(reservation))
    }

    /// Free a confirmed slot.
    ///
    /// # Errors
    ///
    /// As [`acquire`](Self::acquire).
    pub async fn release_slot(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<ReleaseOutcome, LedgerError> {
        let mut guard = self.acquire(event_id).await?;
        Ok(guard.release_slot(user_id))
    }

    /// Point-in-time view of an event's book.
    ///
    /// # Errors
    ///
    /// As [`acquire`](Self::acquire).
    pub async fn snapshot(&self, event_id: EventId) -> Result<LedgerSnapshot, LedgerError> {
        Ok(self.acquire(event_id).await?.snapshot())
    }

    /// Purge expired holds in every book that is not currently locked.
    ///
    /// Returns the number of holds released.
    pub fn sweep_expired(&self) -> usize {
        let entries: Vec<Arc<AsyncMutex<SlotBook>>> = self
            .books
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let now = self.clock.now();

        entries
            .iter()
            .filter_map(|entry| entry.try_lock().ok())
            .map(|mut book| book.purge_expired(now))
            .sum()
    }

    /// Drop the in-memory book of a deleted event.
    pub fn forget(&self, event_id: EventId) {
        self.books
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&event_id);
    }

    /// Events with a book in memory
    #[must_use]
    pub fn tracked_events(&self) -> Vec<EventId> {
        self.books
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }
}

impl std::fmt::Debug for CapacityLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityLedger")
            .field("lease_ttl", &self.lease_ttl)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}
