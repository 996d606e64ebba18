//! Consistency synchronizer: keeps the three views of a registration in step.
//!
//! A confirmed registration is recorded three times:
//!
//! ```text
//! Registration(event, user).status == Confirmed     <- commit point
//! UserAccount(user).registered_events ∋ event        <- participant mirror
//! Event(event).attendee_ids ∋ user                   <- event mirror
//! ```
//!
//! Writes always go row first, then the user mirror, then the event mirror,
//! each as an optimistic read-modify-write loop. The repository offers no
//! multi-key transaction, so a crash between the steps leaves the views apart
//! for a while; [`ConsistencySynchronizer::reconcile`] finds and repairs such
//! gaps, completing an interrupted registration whenever the row says it was
//! committed.
//!
//! All methods that touch one event's records expect the caller to hold that
//! event's [`SlotGuard`](crate::ledger::SlotGuard).

use crate::config::SyncConfig;
use crate::ledger::{CapacityLedger, LedgerError, SlotGuard};
use crate::notifier::ChangeNotifier;
use eventflow_core::environment::Clock;
use eventflow_core::{
    CancelReason, ChangeDraft, ChangePayload, ConflictKind, Entity, EntityKey, EntityType, Event,
    EventId, ExpectedVersion, Mutation, Record, Registration, RegistrationError,
    RegistrationStatus, Repository, RepositoryError, UserAccount, UserId, WriteOutcome,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors from mirror writes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Storage failure
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Every optimistic write attempt lost a race
    #[error("Gave up writing {key} after repeated version conflicts")]
    Contended {
        /// Record that could not be written
        key: EntityKey,
    },

    /// The event record is gone
    #[error("Event not found: {0}")]
    MissingEvent(EventId),

    /// The account record is gone
    #[error("User not found: {0}")]
    MissingUser(UserId),

    /// The event's attendee set is already full
    #[error("Event {0} is full")]
    CapacityExceeded(EventId),

    /// Ledger failure during reconciliation
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl From<LedgerError> for RegistrationError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::EventNotFound(id) | LedgerError::Closed(id) => Self::event_not_found(id),
            LedgerError::Contended(_) => Self::TemporaryUnavailable { attempts: 1 },
            LedgerError::Repository(e) => e.into(),
        }
    }
}

impl From<SyncError> for RegistrationError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::Repository(e) => e.into(),
            SyncError::Contended { .. } => Self::Conflict(ConflictKind::VersionMismatch),
            SyncError::MissingEvent(id) => Self::event_not_found(id),
            SyncError::MissingUser(id) => Self::user_not_found(id),
            SyncError::CapacityExceeded(_) => Self::Conflict(ConflictKind::CapacityExceeded),
            SyncError::Ledger(e) => e.into(),
        }
    }
}

/// Records written by a mirror update and the changes to publish for them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MirrorReceipt {
    /// Registration row after the update, if one exists
    pub registration: Option<Registration>,
    /// Changes for every record actually written
    pub changes: Vec<ChangeDraft>,
}

/// Outcome of a reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Events examined
    pub events_scanned: usize,
    /// Repairs performed
    pub repairs: usize,
    /// Events skipped because their lock was contended or a write failed
    pub skipped: Vec<EventId>,
    /// Changes published
    pub changes_published: usize,
}

impl ReconcileReport {
    /// Whether the pass found nothing to repair and skipped nothing
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.repairs == 0 && self.skipped.is_empty()
    }
}

struct Applied<R> {
    record: Option<R>,
    written: bool,
}

fn stamp<R: Record>(record: R, version: u64) -> Result<R, SyncError> {
    let key = record.key();
    let mut entity = record.into_entity();
    entity.set_version(version);
    R::from_entity(entity).ok_or(SyncError::Repository(RepositoryError::KeyMismatch { key }))
}

fn row_change(row: &Registration) -> ChangeDraft {
    ChangeDraft::new(
        Record::key(row),
        row.version,
        ChangePayload::Registration(row.summary()),
    )
}

fn user_change(user: &UserAccount) -> ChangeDraft {
    ChangeDraft::new(Record::key(user), user.version, ChangePayload::UserUpserted(user.summary()))
}

fn event_change(event: &Event) -> ChangeDraft {
    ChangeDraft::new(
        Record::key(event),
        event.version,
        ChangePayload::EventUpserted(event.summary()),
    )
}

fn repaired(kind: &'static str, event_id: EventId, user_id: Option<UserId>) -> usize {
    match user_id {
        Some(user_id) => warn!(repair = kind, %event_id, %user_id, "Reconciliation repair"),
        None => warn!(repair = kind, %event_id, "Reconciliation repair"),
    }
    crate::metrics::record_repair(kind);
    1
}

/// Writes and repairs the registration mirrors.
pub struct ConsistencySynchronizer {
    repository: Arc<dyn Repository>,
    ledger: Arc<CapacityLedger>,
    notifier: ChangeNotifier,
    clock: Arc<dyn Clock>,
    write_attempts: u32,
}

impl std::fmt::Debug for ConsistencySynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencySynchronizer")
            .field("write_attempts", &self.write_attempts)
            .finish_non_exhaustive()
    }
}

impl ConsistencySynchronizer {
    /// Create a synchronizer.
    #[must_use]
    pub fn new(
        repository: Arc<dyn Repository>,
        ledger: Arc<CapacityLedger>,
        notifier: ChangeNotifier,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            repository,
            ledger,
            notifier,
            clock,
            write_attempts: config.mirror_write_attempts.max(1),
        }
    }

    async fn load<R: Record>(&self, key: EntityKey) -> Result<Option<R>, SyncError> {
        match self.repository.read(key).await? {
            Some(entity) => R::from_entity(entity)
                .map(Some)
                .ok_or(SyncError::Repository(RepositoryError::KeyMismatch { key })),
            None => Ok(None),
        }
    }

    /// Optimistic read-modify-write of one record.
    ///
    /// `apply` sees the current record and returns the replacement, or `None`
    /// to leave it as is. It is called again after every lost race.
    async fn mutate<R, F>(&self, key: EntityKey, mut apply: F) -> Result<Applied<R>, SyncError>
    where
        R: Record,
        F: FnMut(Option<&R>) -> Result<Option<R>, SyncError> + Send,
    {
        for attempt in 1..=self.write_attempts {
            let current = self.load::<R>(key).await?;
            let Some(next) = apply(current.as_ref())? else {
                return Ok(Applied {
                    record: current,
                    written: false,
                });
            };

            let expected = ExpectedVersion::of(current.as_ref().map(Record::version));
            match self
                .repository
                .write(key, Mutation::Put(next.clone().into_entity()), expected)
                .await?
            {
                WriteOutcome::Committed(version) => {
                    return Ok(Applied {
                        record: Some(stamp(next, version)?),
                        written: true,
                    });
                }
                WriteOutcome::VersionMismatch { current } => {
                    debug!(%key, attempt, ?current, "Mirror write lost a race; re-reading");
                }
            }
        }
        Err(SyncError::Contended { key })
    }

    async fn write_row(
        &self,
        event_id: EventId,
        user_id: UserId,
        status: RegistrationStatus,
        commit_seq: u64,
        reason: Option<CancelReason>,
        only_if_seq: Option<u64>,
    ) -> Result<Applied<Registration>, SyncError> {
        let now = self.clock.now();
        self.mutate::<Registration, _>(EntityKey::Registration(event_id, user_id), |current| {
            match current {
                Some(row) if only_if_seq.is_some_and(|seq| row.committed_at != seq) => Ok(None),
                Some(row)
                    if row.status == status
                        && (reason.is_some() || row.committed_at == commit_seq) =>
                {
                    Ok(None)
                }
                None if status == RegistrationStatus::Cancelled => Ok(None),
                _ => Ok(Some(Registration {
                    event_id,
                    user_id,
                    status,
                    committed_at: current.map_or(commit_seq, |row| {
                        if status == RegistrationStatus::Confirmed {
                            commit_seq
                        } else {
                            row.committed_at
                        }
                    }),
                    cancel_reason: reason,
                    updated_at: now,
                    version: current.map_or(0, |row| row.version),
                })),
            }
        })
        .await
    }

    async fn set_user_mirror(
        &self,
        user_id: UserId,
        event_id: EventId,
        member: bool,
        required: bool,
    ) -> Result<Applied<UserAccount>, SyncError> {
        self.mutate::<UserAccount, _>(EntityKey::User(user_id), |current| {
            let Some(user) = current else {
                return if required {
                    Err(SyncError::MissingUser(user_id))
                } else {
                    Ok(None)
                };
            };
            if user.registered_events.contains(&event_id) == member {
                return Ok(None);
            }
            let mut user = user.clone();
            if member {
                user.registered_events.insert(event_id);
            } else {
                user.registered_events.remove(&event_id);
            }
            Ok(Some(user))
        })
        .await
    }

    async fn set_attendee(
        &self,
        event_id: EventId,
        user_id: UserId,
        member: bool,
    ) -> Result<Applied<Event>, SyncError> {
        self.mutate::<Event, _>(EntityKey::Event(event_id), |current| {
            let Some(event) = current else {
                return if member {
                    Err(SyncError::MissingEvent(event_id))
                } else {
                    Ok(None)
                };
            };
            if event.attendee_ids.contains(&user_id) == member {
                return Ok(None);
            }
            if member && event.attendee_ids.len() >= event.capacity as usize {
                return Err(SyncError::CapacityExceeded(event_id));
            }
            let mut event = event.clone();
            if member {
                event.attendee_ids.insert(user_id);
            } else {
                event.attendee_ids.remove(&user_id);
            }
            Ok(Some(event))
        })
        .await
    }

    async fn set_attendees(
        &self,
        event_id: EventId,
        attendees: &BTreeSet<UserId>,
    ) -> Result<Applied<Event>, SyncError> {
        self.mutate::<Event, _>(EntityKey::Event(event_id), |current| {
            let Some(event) = current else {
                return Ok(None);
            };
            if &event.attendee_ids == attendees {
                return Ok(None);
            }
            let mut event = event.clone();
            event.attendee_ids.clone_from(attendees);
            Ok(Some(event))
        })
        .await
    }

    fn receipt(
        row: Applied<Registration>,
        user: Option<Applied<UserAccount>>,
        event: Option<Applied<Event>>,
    ) -> MirrorReceipt {
        let mut changes = Vec::new();
        if let (true, Some(row)) = (row.written, &row.record) {
            changes.push(row_change(row));
        }
        if let Some(Applied { record: Some(user), written: true }) = &user {
            changes.push(user_change(user));
        }
        if let Some(Applied { record: Some(event), written: true }) = &event {
            changes.push(event_change(event));
        }
        MirrorReceipt {
            registration: row.record,
            changes,
        }
    }

    /// Record a confirmed registration in all three views.
    ///
    /// # Errors
    ///
    /// - [`SyncError::MissingUser`] / [`SyncError::MissingEvent`] if a record vanished
    /// - [`SyncError::CapacityExceeded`] if the event mirror is already full
    /// - [`SyncError::Contended`] / [`SyncError::Repository`] on write failure
    ///
    /// On error the views may be partly written; the caller rolls back with
    /// [`rollback_registration`](Self::rollback_registration).
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn record_registration(
        &self,
        event_id: EventId,
        user_id: UserId,
        commit_seq: u64,
    ) -> Result<MirrorReceipt, SyncError> {
        let row = self
            .write_row(event_id, user_id, RegistrationStatus::Confirmed, commit_seq, None, None)
            .await?;
        let user = self.set_user_mirror(user_id, event_id, true, true).await?;
        let event = self.set_attendee(event_id, user_id, true).await?;
        Ok(Self::receipt(row, Some(user), Some(event)))
    }

    /// Record a cancellation in all three views.
    ///
    /// A missing row, account or event is skipped rather than reported, so
    /// the method can finish cascades for records that are being removed.
    ///
    /// # Errors
    ///
    /// [`SyncError::Contended`] / [`SyncError::Repository`] on write failure.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn record_cancellation(
        &self,
        event_id: EventId,
        user_id: UserId,
        reason: CancelReason,
    ) -> Result<MirrorReceipt, SyncError> {
        let row = self
            .write_row(event_id, user_id, RegistrationStatus::Cancelled, 0, Some(reason), None)
            .await?;
        let user = self.set_user_mirror(user_id, event_id, false, false).await?;
        let event = self.set_attendee(event_id, user_id, false).await?;
        Ok(Self::receipt(row, Some(user), Some(event)))
    }

    /// Undo a registration that could not be fully recorded.
    ///
    /// Only a row still carrying `commit_seq` is cancelled, so a rollback
    /// never undoes a later registration of the same user. Safe to repeat.
    ///
    /// # Errors
    ///
    /// [`SyncError::Contended`] / [`SyncError::Repository`] on write failure.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn rollback_registration(
        &self,
        event_id: EventId,
        user_id: UserId,
        commit_seq: u64,
    ) -> Result<MirrorReceipt, SyncError> {
        let row = self
            .write_row(
                event_id,
                user_id,
                RegistrationStatus::Cancelled,
                commit_seq,
                Some(CancelReason::RolledBack),
                Some(commit_seq),
            )
            .await?;
        if row.record.as_ref().is_some_and(Registration::is_confirmed) {
            return Ok(Self::receipt(row, None, None));
        }
        let user = self.set_user_mirror(user_id, event_id, false, false).await?;
        let event = self.set_attendee(event_id, user_id, false).await?;
        info!(%event_id, %user_id, commit_seq, "Rolled back interrupted registration");
        Ok(Self::receipt(row, Some(user), Some(event)))
    }

    /// Scan every event and repair divergence between the ledger, the
    /// registration rows and both mirrors.
    ///
    /// Failures are logged and the affected event is reported as skipped; the
    /// next pass picks it up again.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Repository`] only when the initial scan fails.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        let events = self.repository.list(EntityType::Event).await?;
        let rows = self.repository.list(EntityType::Registration).await?;
        let users = self.repository.list(EntityType::User).await?;

        let mut interest: BTreeMap<EventId, BTreeSet<UserId>> = BTreeMap::new();
        for entity in &events {
            if let Entity::Event(event) = entity {
                interest.entry(event.id).or_default().extend(&event.attendee_ids);
            }
        }
        let mut orphans: BTreeSet<(EventId, UserId)> = BTreeSet::new();
        for entity in rows.iter().chain(&users) {
            let pairs: Vec<(EventId, UserId)> = match entity {
                Entity::Registration(row) if row.is_confirmed() => {
                    vec![(row.event_id, row.user_id)]
                }
                Entity::User(user) => {
                    user.registered_events.iter().map(|e| (*e, user.id)).collect()
                }
                _ => Vec::new(),
            };
            for (event_id, user_id) in pairs {
                match interest.get_mut(&event_id) {
                    Some(set) => {
                        set.insert(user_id);
                    }
                    None => {
                        orphans.insert((event_id, user_id));
                    }
                }
            }
        }

        let mut report = ReconcileReport::default();
        let mut changes = Vec::new();

        for (event_id, users) in interest {
            report.events_scanned += 1;
            let mut guard = match self.ledger.acquire(event_id).await {
                Ok(guard) => guard,
                Err(LedgerError::EventNotFound(_)) => continue,
                Err(e) => {
                    warn!(%event_id, error = %e, "Skipping event in reconciliation");
                    report.skipped.push(event_id);
                    continue;
                }
            };
            match self.reconcile_event(&mut guard, users, &mut changes).await {
                Ok(repairs) => report.repairs += repairs,
                Err(e) => {
                    error!(%event_id, error = %e, "Reconciliation of event failed");
                    report.skipped.push(event_id);
                }
            }
        }

        for (event_id, user_id) in orphans {
            match self.reconcile_deleted(event_id, user_id, &mut changes).await {
                Ok(repairs) => report.repairs += repairs,
                Err(e) => {
                    error!(%event_id, %user_id, error = %e, "Cleanup after deleted event failed");
                    report.skipped.push(event_id);
                }
            }
        }

        report.changes_published = self.notifier.publish(changes).len();
        if report.is_clean() {
            debug!(events = report.events_scanned, "Reconciliation found no divergence");
        } else {
            info!(
                events = report.events_scanned,
                repairs = report.repairs,
                skipped = report.skipped.len(),
                "Reconciliation pass complete"
            );
        }
        Ok(report)
    }

    async fn reconcile_event(
        &self,
        guard: &mut SlotGuard,
        candidates: BTreeSet<UserId>,
        changes: &mut Vec<ChangeDraft>,
    ) -> Result<usize, SyncError> {
        let event_id = guard.event_id();
        let Some(event) = self.load::<Event>(EntityKey::Event(event_id)).await? else {
            return Ok(0);
        };
        let pending = guard.pending_users();
        let mut repairs = 0;
        let mut next_seq = guard.book().next_commit_seq();

        let mut members: Vec<(UserId, u64)> = Vec::new();
        let mut rows: HashMap<UserId, Registration> = HashMap::new();
        let mut accounts: HashSet<UserId> = HashSet::new();

        for user_id in candidates.iter().copied().filter(|u| !pending.contains(u)) {
            let row = self
                .load::<Registration>(EntityKey::Registration(event_id, user_id))
                .await?;
            let has_account = self.load::<UserAccount>(EntityKey::User(user_id)).await?.is_some();
            if has_account {
                accounts.insert(user_id);
            }
            let attendee = event.attendee_ids.contains(&user_id);
            let confirmed = row.as_ref().is_some_and(Registration::is_confirmed);
            let committed_at = row.as_ref().map(|row| row.committed_at);

            let seq = match (attendee, confirmed, has_account) {
                (true, true, true) => committed_at,
                (false, true, true) => {
                    repairs += repaired("missing_attendee", event_id, Some(user_id));
                    committed_at
                }
                (true, false, true) if row.is_none() => {
                    repairs += repaired("completed_registration", event_id, Some(user_id));
                    Some(guard.book().commit_seq_of(&user_id).unwrap_or_else(|| {
                        next_seq += 1;
                        next_seq - 1
                    }))
                }
                (true, false, _) => {
                    repairs += repaired("stale_attendee", event_id, Some(user_id));
                    None
                }
                (_, true, false) => {
                    repairs += repaired("orphan_registration", event_id, Some(user_id));
                    None
                }
                _ => None,
            };
            if let Some(seq) = seq {
                members.push((user_id, seq));
            }
            if let Some(row) = row {
                rows.insert(user_id, row);
            }
        }

        let limit = (event.capacity as usize).saturating_sub(pending.len());
        members.sort_by_key(|(user_id, seq)| (*seq, *user_id));
        if members.len() > limit {
            for (user_id, _) in members.split_off(limit) {
                repairs += repaired("over_capacity", event_id, Some(user_id));
            }
        }
        let member_ids: BTreeSet<UserId> = members.iter().map(|(u, _)| *u).collect();

        for (user_id, seq) in &members {
            if !rows.get(user_id).is_some_and(Registration::is_confirmed) {
                let row = self
                    .write_row(event_id, *user_id, RegistrationStatus::Confirmed, *seq, None, None)
                    .await?;
                Self::collect(row, changes, row_change);
            }
        }
        for (user_id, row) in &rows {
            if row.is_confirmed() && !member_ids.contains(user_id) {
                let row = self
                    .write_row(
                        event_id,
                        *user_id,
                        RegistrationStatus::Cancelled,
                        0,
                        Some(CancelReason::Reconciled),
                        None,
                    )
                    .await?;
                Self::collect(row, changes, row_change);
            }
        }

        let kept: BTreeSet<UserId> = event
            .attendee_ids
            .iter()
            .filter(|u| pending.contains(u))
            .copied()
            .chain(member_ids.iter().copied())
            .collect();
        Self::collect(self.set_attendees(event_id, &kept).await?, changes, event_change);

        for user_id in candidates.iter().filter(|u| accounts.contains(u) && !pending.contains(u)) {
            let user = self
                .set_user_mirror(*user_id, event_id, member_ids.contains(user_id), false)
                .await?;
            if user.written {
                repairs += repaired("user_mirror", event_id, Some(*user_id));
            }
            Self::collect(user, changes, user_change);
        }

        let ledger_view: BTreeSet<(UserId, u64)> = guard
            .book()
            .by_commit_order()
            .into_iter()
            .map(|e| (e.user_id, e.commit_seq))
            .collect();
        let wanted: BTreeSet<(UserId, u64)> = members.iter().copied().collect();
        if ledger_view != wanted || guard.book().capacity() != event.capacity {
            guard.rebuild(event.capacity, members.iter().copied());
            repairs += repaired("ledger_drift", event_id, None);
        }
        crate::metrics::record_capacity_remaining(event_id, guard.book().remaining());

        Ok(repairs)
    }

    async fn reconcile_deleted(
        &self,
        event_id: EventId,
        user_id: UserId,
        changes: &mut Vec<ChangeDraft>,
    ) -> Result<usize, SyncError> {
        if self.load::<Event>(EntityKey::Event(event_id)).await?.is_some() {
            return Ok(0);
        }
        let receipt = self
            .record_cancellation(event_id, user_id, CancelReason::EventDeleted)
            .await?;
        let repairs = if receipt.changes.is_empty() {
            0
        } else {
            repaired("deleted_event", event_id, Some(user_id))
        };
        changes.extend(receipt.changes);
        Ok(repairs)
    }

    fn collect<R>(
        applied: Applied<R>,
        changes: &mut Vec<ChangeDraft>,
        change: fn(&R) -> ChangeDraft,
    ) {
        if let (true, Some(record)) = (applied.written, &applied.record) {
            changes.push(change(record));
        }
    }
}
