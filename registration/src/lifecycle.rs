//! Administrative lifecycle of events and accounts.
//!
//! Everything here requires an administrator except the read-only listings.
//! Mutations that affect registrations (capacity reduction, event deletion,
//! account removal) cancel them through
//! [`RegistrationCoordinator::cancel_under_guard`], the same path a
//! participant's own cancellation takes, so every affected participant is
//! notified.

use crate::coordinator::RegistrationCoordinator;
use crate::ledger::CapacityLedger;
use crate::metrics as business;
use crate::notifier::ChangeNotifier;
use chrono::{NaiveDate, NaiveTime};
use eventflow_core::environment::Clock;
use eventflow_core::{
    CancelReason, Caller, Category, ChangeDraft, ChangePayload, ConflictKind, Entity, EntityKey,
    EntityType, Event, EventId, EventSummary, ExpectedVersion, Mutation, RegistrationError,
    Repository, Role, UserAccount, UserId, UserSummary, WriteOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

const WRITE_ATTEMPTS: u32 = 4;

/// Event creation form, as submitted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDraft {
    /// Title
    pub title: String,
    /// Free-text description
    pub description: String,
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM`
    pub time: String,
    /// Venue
    pub location: String,
    /// academic, cultural, sports or technical
    pub category: String,
    /// Number of slots, must be positive
    pub capacity: i64,
}

/// Partial update of an event; `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPatch {
    /// New title
    pub title: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New date, `YYYY-MM-DD`
    pub date: Option<String>,
    /// New time, `HH:MM`
    pub time: Option<String>,
    /// New venue
    pub location: Option<String>,
    /// New category
    pub category: Option<String>,
    /// New capacity; reductions evict the most recent registrations
    pub capacity: Option<i64>,
}

/// Account provisioning form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDraft {
    /// Role of the new account
    pub role: Role,
    /// Display name
    pub name: String,
    /// Contact email
    pub email: String,
    /// Institutional identifier
    pub student_id: String,
    /// Department
    pub department: String,
}

/// Result of [`EventLifecycleManager::update_event`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventUpdate {
    /// Event after the update
    pub event: Event,
    /// Participants evicted by a capacity reduction, most recent first
    pub evicted: Vec<UserId>,
}

/// Result of [`EventLifecycleManager::delete_event`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventDeletion {
    /// Deleted event
    pub event_id: EventId,
    /// Participants whose registration was cancelled
    pub cancelled: Vec<UserId>,
}

/// Result of [`EventLifecycleManager::remove_user`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserRemoval {
    /// Removed account
    pub user_id: UserId,
    /// Events whose registration was cancelled
    pub cancelled: Vec<EventId>,
}

fn require_admin(caller: &Caller) -> Result<(), RegistrationError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(RegistrationError::Unauthorized(
            "administrator role required".to_string(),
        ))
    }
}

fn required(field: &str, value: &str) -> Result<String, RegistrationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(RegistrationError::Validation(format!("{field} is required")));
    }
    Ok(value.to_string())
}

fn parse_date(value: &str) -> Result<NaiveDate, RegistrationError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| {
            RegistrationError::Validation(format!("date must be YYYY-MM-DD, got {value:?}"))
        })
}

fn parse_time(value: &str) -> Result<NaiveTime, RegistrationError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| RegistrationError::Validation(format!("time must be HH:MM, got {value:?}")))
}

fn parse_category(value: &str) -> Result<Category, RegistrationError> {
    value.trim().parse().map_err(RegistrationError::Validation)
}

fn parse_capacity(value: i64) -> Result<u32, RegistrationError> {
    u32::try_from(value)
        .ok()
        .filter(|capacity| *capacity > 0)
        .ok_or_else(|| {
            RegistrationError::Validation(format!("capacity must be a positive integer, got {value}"))
        })
}

fn event_change(event: &Event) -> ChangeDraft {
    ChangeDraft::new(
        EntityKey::Event(event.id),
        event.version,
        ChangePayload::EventUpserted(event.summary()),
    )
}

/// Administrative create/update/delete of events and accounts.
pub struct EventLifecycleManager {
    repository: Arc<dyn Repository>,
    ledger: Arc<CapacityLedger>,
    coordinator: Arc<RegistrationCoordinator>,
    notifier: ChangeNotifier,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EventLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLifecycleManager").finish_non_exhaustive()
    }
}

impl EventLifecycleManager {
    /// Create a lifecycle manager.
    #[must_use]
    pub fn new(
        repository: Arc<dyn Repository>,
        ledger: Arc<CapacityLedger>,
        coordinator: Arc<RegistrationCoordinator>,
        notifier: ChangeNotifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            ledger,
            coordinator,
            notifier,
            clock,
        }
    }

    /// Create an event.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::Unauthorized`] for non-administrators
    /// - [`RegistrationError::Validation`] for empty title or location, a
    ///   non-positive capacity, or a malformed date, time or category
    #[tracing::instrument(skip(self, draft), fields(title = %draft.title))]
    pub async fn create_event(
        &self,
        caller: &Caller,
        draft: EventDraft,
    ) -> Result<Event, RegistrationError> {
        require_admin(caller)?;
        let mut event = Event {
            id: EventId::new(),
            title: required("title", &draft.title)?,
            description: draft.description.trim().to_string(),
            date: parse_date(&draft.date)?,
            time: parse_time(&draft.time)?,
            location: required("location", &draft.location)?,
            category: parse_category(&draft.category)?,
            capacity: parse_capacity(draft.capacity)?,
            attendee_ids: BTreeSet::new(),
            created_at: self.clock.now(),
            version: 0,
        };

        match self
            .repository
            .write(
                EntityKey::Event(event.id),
                Mutation::Put(Entity::Event(event.clone())),
                ExpectedVersion::Absent,
            )
            .await?
        {
            WriteOutcome::Committed(version) => event.version = version,
            WriteOutcome::VersionMismatch { .. } => {
                return Err(RegistrationError::Internal(format!(
                    "event id {} already taken",
                    event.id
                )));
            }
        }

        self.notifier.publish(vec![event_change(&event)]);
        business::record_event_created();
        business::record_capacity_remaining(event.id, event.capacity);
        info!(event_id = %event.id, capacity = event.capacity, "Event created");
        Ok(event)
    }

    /// Update an event.
    ///
    /// Reducing the capacity below the confirmed count evicts the most
    /// recently committed registrations first. Evictions are committed before
    /// the new capacity is written, so the attendee set never exceeds the
    /// stored capacity.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::Unauthorized`] / [`RegistrationError::Validation`] as for creation
    /// - [`RegistrationError::NotFound`] if the event does not exist
    /// - [`RegistrationError::TemporaryUnavailable`] if the event stays contended
    #[tracing::instrument(skip(self, patch))]
    pub async fn update_event(
        &self,
        caller: &Caller,
        event_id: EventId,
        patch: EventPatch,
    ) -> Result<EventUpdate, RegistrationError> {
        require_admin(caller)?;
        let title = patch.title.as_deref().map(|t| required("title", t)).transpose()?;
        let location = patch
            .location
            .as_deref()
            .map(|l| required("location", l))
            .transpose()?;
        let date = patch.date.as_deref().map(parse_date).transpose()?;
        let time = patch.time.as_deref().map(parse_time).transpose()?;
        let category = patch.category.as_deref().map(parse_category).transpose()?;
        let capacity = patch.capacity.map(parse_capacity).transpose()?;

        let mut guard = self.coordinator.lock(event_id).await?;

        let mut written = None;
        for _ in 0..WRITE_ATTEMPTS {
            let Some(Entity::Event(mut event)) =
                self.repository.read(EntityKey::Event(event_id)).await?
            else {
                return Err(RegistrationError::event_not_found(event_id));
            };
            let expected = ExpectedVersion::Exact(event.version);
            if let Some(title) = &title {
                event.title.clone_from(title);
            }
            if let Some(description) = &patch.description {
                event.description = description.trim().to_string();
            }
            if let Some(location) = &location {
                event.location.clone_from(location);
            }
            event.date = date.unwrap_or(event.date);
            event.time = time.unwrap_or(event.time);
            event.category = category.unwrap_or(event.category);
            event.capacity = capacity.unwrap_or(event.capacity);

            match self
                .repository
                .write(
                    EntityKey::Event(event_id),
                    Mutation::Put(Entity::Event(event.clone())),
                    expected,
                )
                .await?
            {
                WriteOutcome::Committed(version) => {
                    event.version = version;
                    written = Some(event);
                    break;
                }
                WriteOutcome::VersionMismatch { .. } => {}
            }
        }
        let Some(event) = written else {
            return Err(RegistrationError::Conflict(ConflictKind::VersionMismatch));
        };
        self.notifier.publish(vec![event_change(&event)]);

        // The stored capacity is authoritative from here on. Evictions that
        // fail are finished by the next reconciliation pass.
        let mut evicted = Vec::new();
        let evictions = match capacity {
            Some(capacity) => guard.resize(capacity),
            None => Vec::new(),
        };
        for eviction in &evictions {
            if let Err(e) = self
                .coordinator
                .cancel_under_guard(&mut guard, eviction.user_id, CancelReason::Evicted)
                .await
            {
                error!(
                    %event_id,
                    user_id = %eviction.user_id,
                    error = %e,
                    "Eviction failed; left to reconciliation"
                );
                return Err(e);
            }
            warn!(%event_id, user_id = %eviction.user_id, "Evicted by capacity reduction");
            evicted.push(eviction.user_id);
        }

        business::record_capacity_remaining(event_id, guard.book().remaining());
        info!(%event_id, evicted = evicted.len(), "Event updated");

        Ok(EventUpdate { event, evicted })
    }

    /// Delete an event, cancelling every registration first.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::Unauthorized`] for non-administrators
    /// - [`RegistrationError::NotFound`] if the event does not exist
    /// - [`RegistrationError::TemporaryUnavailable`] if the event stays contended
    #[tracing::instrument(skip(self))]
    pub async fn delete_event(
        &self,
        caller: &Caller,
        event_id: EventId,
    ) -> Result<EventDeletion, RegistrationError> {
        require_admin(caller)?;
        let mut guard = self.coordinator.lock(event_id).await?;
        let Some(Entity::Event(event)) = self.repository.read(EntityKey::Event(event_id)).await?
        else {
            return Err(RegistrationError::event_not_found(event_id));
        };

        let released = guard.close();
        let mut targets: Vec<(UserId, Option<u64>)> = released
            .iter()
            .map(|e| (e.user_id, Some(e.commit_seq)))
            .collect();
        for user_id in &event.attendee_ids {
            if !targets.iter().any(|(u, _)| u == user_id) {
                targets.push((*user_id, None));
            }
        }

        let mut cancelled = Vec::with_capacity(targets.len());
        for (index, (user_id, _)) in targets.iter().enumerate() {
            if let Err(e) = self
                .coordinator
                .cancel_under_guard(&mut guard, *user_id, CancelReason::EventDeleted)
                .await
            {
                error!(%event_id, %user_id, error = %e, "Cascade cancellation failed; event kept");
                guard.reopen();
                for (pending, seq) in &targets[index..] {
                    if self.still_confirmed(event_id, *pending).await {
                        guard.adopt(*pending, *seq);
                    }
                }
                return Err(e);
            }
            cancelled.push(*user_id);
        }

        let mut deleted_version = None;
        for _ in 0..WRITE_ATTEMPTS {
            let Some(current) = self.repository.read(EntityKey::Event(event_id)).await? else {
                break;
            };
            if self
                .repository
                .write(
                    EntityKey::Event(event_id),
                    Mutation::Delete,
                    ExpectedVersion::Exact(current.version()),
                )
                .await?
                .is_committed()
            {
                deleted_version = Some(current.version());
                break;
            }
        }
        let Some(version) = deleted_version else {
            guard.reopen();
            return Err(RegistrationError::Conflict(ConflictKind::VersionMismatch));
        };

        self.notifier.publish(vec![ChangeDraft::new(
            EntityKey::Event(event_id),
            version + 1,
            ChangePayload::EventDeleted(event_id),
        )]);
        drop(guard);
        self.ledger.forget(event_id);
        info!(%event_id, cancelled = cancelled.len(), "Event deleted");

        Ok(EventDeletion {
            event_id,
            cancelled,
        })
    }

    /// Create an account.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::Unauthorized`] for non-administrators
    /// - [`RegistrationError::Validation`] for empty fields, an email without
    ///   `@`, or an email already in use
    #[tracing::instrument(skip(self, draft), fields(email = %draft.email))]
    pub async fn provision_user(
        &self,
        caller: &Caller,
        draft: UserDraft,
    ) -> Result<UserAccount, RegistrationError> {
        require_admin(caller)?;
        let email = required("email", &draft.email)?;
        if !email.contains('@') {
            return Err(RegistrationError::Validation(format!(
                "email must contain '@', got {email:?}"
            )));
        }
        let taken = self
            .repository
            .list(EntityType::User)
            .await?
            .into_iter()
            .any(|entity| {
                matches!(entity, Entity::User(u) if u.email.eq_ignore_ascii_case(&email))
            });
        if taken {
            return Err(RegistrationError::Validation(format!(
                "email {email} is already registered"
            )));
        }

        let mut user = UserAccount {
            id: UserId::new(),
            role: draft.role,
            name: required("name", &draft.name)?,
            email,
            student_id: required("student id", &draft.student_id)?,
            department: required("department", &draft.department)?,
            registered_events: BTreeSet::new(),
            created_at: self.clock.now(),
            version: 0,
        };
        match self
            .repository
            .write(
                EntityKey::User(user.id),
                Mutation::Put(Entity::User(user.clone())),
                ExpectedVersion::Absent,
            )
            .await?
        {
            WriteOutcome::Committed(version) => user.version = version,
            WriteOutcome::VersionMismatch { .. } => {
                return Err(RegistrationError::Internal(format!(
                    "user id {} already taken",
                    user.id
                )));
            }
        }

        self.notifier.publish(vec![ChangeDraft::new(
            EntityKey::User(user.id),
            user.version,
            ChangePayload::UserUpserted(user.summary()),
        )]);
        info!(user_id = %user.id, role = %user.role, "User provisioned");
        Ok(user)
    }

    /// Remove an account, cancelling its registrations first.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::Unauthorized`] for non-administrators
    /// - [`RegistrationError::Validation`] when administrators remove themselves
    /// - [`RegistrationError::NotFound`] if the account does not exist
    #[tracing::instrument(skip(self))]
    pub async fn remove_user(
        &self,
        caller: &Caller,
        user_id: UserId,
    ) -> Result<UserRemoval, RegistrationError> {
        require_admin(caller)?;
        if caller.user_id == user_id {
            return Err(RegistrationError::Validation(
                "administrators cannot remove their own account".to_string(),
            ));
        }
        let Some(Entity::User(user)) = self.repository.read(EntityKey::User(user_id)).await? else {
            return Err(RegistrationError::user_not_found(user_id));
        };

        let mut events: BTreeSet<EventId> = user.registered_events.clone();
        for entity in self.repository.list(EntityType::Registration).await? {
            if let Entity::Registration(row) = entity {
                if row.user_id == user_id && row.is_confirmed() {
                    events.insert(row.event_id);
                }
            }
        }

        let mut cancelled = Vec::new();
        for event_id in events {
            let mut guard = match self.coordinator.lock(event_id).await {
                Ok(guard) => guard,
                Err(RegistrationError::NotFound(..)) => continue,
                Err(e) => return Err(e),
            };
            let confirmed = matches!(
                self.repository.read(EntityKey::Registration(event_id, user_id)).await?,
                Some(Entity::Registration(row)) if row.is_confirmed()
            );
            if confirmed {
                self.coordinator
                    .cancel_under_guard(&mut guard, user_id, CancelReason::UserRemoved)
                    .await?;
                cancelled.push(event_id);
            }
        }

        let mut deleted_version = None;
        for _ in 0..WRITE_ATTEMPTS {
            let Some(current) = self.repository.read(EntityKey::User(user_id)).await? else {
                break;
            };
            if self
                .repository
                .write(
                    EntityKey::User(user_id),
                    Mutation::Delete,
                    ExpectedVersion::Exact(current.version()),
                )
                .await?
                .is_committed()
            {
                deleted_version = Some(current.version());
                break;
            }
        }
        let Some(version) = deleted_version else {
            return Err(RegistrationError::Conflict(ConflictKind::VersionMismatch));
        };

        self.notifier.publish(vec![ChangeDraft::new(
            EntityKey::User(user_id),
            version + 1,
            ChangePayload::UserRemoved(user_id),
        )]);
        info!(%user_id, cancelled = cancelled.len(), "User removed");
        Ok(UserRemoval { user_id, cancelled })
    }

    /// Participant accounts, ordered by name. Administrators are not listed.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::Unauthorized`] for non-administrators.
    pub async fn list_users(&self, caller: &Caller) -> Result<Vec<UserSummary>, RegistrationError> {
        require_admin(caller)?;
        let mut users: Vec<UserSummary> = self
            .repository
            .list(EntityType::User)
            .await?
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::User(user) if user.role == Role::Participant => Some(user.summary()),
                _ => None,
            })
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name).then(a.email.cmp(&b.email)));
        Ok(users)
    }

    /// Every event, newest date and time first.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::Internal`] on storage failure.
    pub async fn list_events(&self) -> Result<Vec<EventSummary>, RegistrationError> {
        let mut events: Vec<EventSummary> = self
            .repository
            .list(EntityType::Event)
            .await?
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::Event(event) => Some(event.summary()),
                _ => None,
            })
            .collect();
        events.sort_by(|a, b| (b.date, b.time).cmp(&(a.date, a.time)));
        Ok(events)
    }

    /// One event.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::NotFound`] if the event does not exist.
    pub async fn get_event(&self, event_id: EventId) -> Result<EventSummary, RegistrationError> {
        match self.repository.read(EntityKey::Event(event_id)).await? {
            Some(Entity::Event(event)) => Ok(event.summary()),
            _ => Err(RegistrationError::event_not_found(event_id)),
        }
    }

    async fn still_confirmed(&self, event_id: EventId, user_id: UserId) -> bool {
        matches!(
            self.repository.read(EntityKey::Registration(event_id, user_id)).await,
            Ok(Some(Entity::Registration(row))) if row.is_confirmed()
        )
    }

    /// Remaining capacity according to the ledger.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::NotFound`] if the event does not exist.
    pub async fn capacity_remaining(&self, event_id: EventId) -> Result<u32, RegistrationError> {
        Ok(self.ledger.snapshot(event_id).await?.remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_must_be_positive() {
        assert!(parse_capacity(0).is_err());
        assert!(parse_capacity(-3).is_err());
        assert_eq!(parse_capacity(25), Ok(25));
    }

    #[test]
    fn schedule_formats() {
        assert!(parse_date("2025-03-14").is_ok());
        assert!(parse_date("14/03/2025").is_err());
        assert!(parse_time("09:30").is_ok());
        assert!(parse_time("9.30am").is_err());
    }

    #[test]
    fn categories_follow_form_options() {
        assert_eq!(parse_category("Sports"), Ok(Category::Sports));
        assert!(parse_category("gaming").is_err());
    }

    #[test]
    fn blank_fields_are_rejected() {
        assert!(required("title", "   ").is_err());
        assert_eq!(required("title", " Rust 101 "), Ok("Rust 101".to_string()));
    }
}
