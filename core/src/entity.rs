//! Persisted records and their repository keys.
//!
//! Each record carries a `version` that the repository bumps on every
//! committed write. Writers read a record, modify it, and write it back with
//! `ExpectedVersion::Exact(version)`; a concurrent writer makes the write fail
//! with a version mismatch instead of silently overwriting.

use crate::change::{EventSummary, RegistrationSummary, UserSummary};
use crate::types::{Category, EventId, Role, UserId};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// Keys
// ============================================================================

/// Entity type discriminator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// An [`Event`]
    Event,
    /// A [`UserAccount`]
    User,
    /// A [`Registration`]
    Registration,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event => write!(f, "event"),
            Self::User => write!(f, "user"),
            Self::Registration => write!(f, "registration"),
        }
    }
}

/// Repository key of a single record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKey {
    /// Key of an event
    Event(EventId),
    /// Key of a user account
    User(UserId),
    /// Composite key of a registration
    Registration(EventId, UserId),
}

impl EntityKey {
    /// Type of the record stored under this key
    #[must_use]
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::Event(_) => EntityType::Event,
            Self::User(_) => EntityType::User,
            Self::Registration(..) => EntityType::Registration,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(id) => write!(f, "event:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
            Self::Registration(event_id, user_id) => {
                write!(f, "registration:{event_id}:{user_id}")
            }
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// A capacity-limited event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event id
    pub id: EventId,
    /// Title shown to participants
    pub title: String,
    /// Free-form description
    pub description: String,
    /// Scheduled date
    pub date: NaiveDate,
    /// Scheduled start time
    pub time: NaiveTime,
    /// Venue
    pub location: String,
    /// Category
    pub category: Category,
    /// Maximum number of confirmed attendees (always > 0)
    pub capacity: u32,
    /// Participants holding a confirmed registration
    pub attendee_ids: BTreeSet<UserId>,
    /// When the event was created
    pub created_at: DateTime<Utc>,
    /// Optimistic-concurrency version
    pub version: u64,
}

impl Event {
    /// Slots still free according to the persisted attendee set
    #[must_use]
    pub fn capacity_remaining(&self) -> u32 {
        let taken = u32::try_from(self.attendee_ids.len()).unwrap_or(u32::MAX);
        self.capacity.saturating_sub(taken)
    }

    /// Public projection shown to observers
    #[must_use]
    pub fn summary(&self) -> EventSummary {
        EventSummary {
            id: self.id,
            title: self.title.clone(),
            date: self.date,
            time: self.time,
            location: self.location.clone(),
            capacity_remaining: self.capacity_remaining(),
            category: self.category,
        }
    }
}

/// A participant or administrator account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    /// Account id
    pub id: UserId,
    /// Role
    pub role: Role,
    /// Display name
    pub name: String,
    /// Contact email
    pub email: String,
    /// Institutional identifier (student number)
    pub student_id: String,
    /// Department
    pub department: String,
    /// Mirror of the events this account holds a confirmed registration for
    pub registered_events: BTreeSet<EventId>,
    /// When the account was provisioned
    pub created_at: DateTime<Utc>,
    /// Optimistic-concurrency version
    pub version: u64,
}

impl UserAccount {
    /// Roster projection shown to administrators
    #[must_use]
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            role: self.role,
            name: self.name.clone(),
            email: self.email.clone(),
            student_id: self.student_id.clone(),
            department: self.department.clone(),
            registered_count: self.registered_events.len(),
        }
    }
}

/// Registration status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    /// Holds a slot
    Confirmed,
    /// Slot released; the row is kept for audit
    Cancelled,
}

/// Why a registration was cancelled
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The participant cancelled
    Participant,
    /// An administrator cancelled on the participant's behalf
    Administrator,
    /// Evicted by a capacity reduction
    Evicted,
    /// The event was deleted
    EventDeleted,
    /// The account was removed
    UserRemoved,
    /// Cancelled by a reconciliation pass
    Reconciled,
    /// An interrupted registration was rolled back
    RolledBack,
}

impl CancelReason {
    /// Stable label used in logs and metrics
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Participant => "participant",
            Self::Administrator => "admin",
            Self::Evicted => "evicted",
            Self::EventDeleted => "event_deleted",
            Self::UserRemoved => "user_removed",
            Self::Reconciled => "reconciled",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration of one user for one event.
///
/// Exactly one row exists per `(event_id, user_id)`. Re-registering after a
/// cancellation flips the same row back to confirmed with a new commit
/// sequence number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Event
    pub event_id: EventId,
    /// Participant
    pub user_id: UserId,
    /// Current status
    pub status: RegistrationStatus,
    /// Per-event commit sequence number of the latest confirmation
    pub committed_at: u64,
    /// Set when `status` is `Cancelled`
    pub cancel_reason: Option<CancelReason>,
    /// Wall-clock time of the last transition
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency version
    pub version: u64,
}

impl Registration {
    /// Whether the registration currently holds a slot
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.status == RegistrationStatus::Confirmed
    }

    /// Projection shown to observers
    #[must_use]
    pub const fn summary(&self) -> RegistrationSummary {
        RegistrationSummary {
            event_id: self.event_id,
            user_id: self.user_id,
            status: self.status,
            committed_at: self.committed_at,
            cancel_reason: self.cancel_reason,
        }
    }
}

// ============================================================================
// Entity envelope
// ============================================================================

/// Any persisted record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entity {
    /// An event
    Event(Event),
    /// A user account
    User(UserAccount),
    /// A registration
    Registration(Registration),
}

impl Entity {
    /// Key of the wrapped record
    #[must_use]
    pub const fn key(&self) -> EntityKey {
        match self {
            Self::Event(event) => EntityKey::Event(event.id),
            Self::User(user) => EntityKey::User(user.id),
            Self::Registration(reg) => EntityKey::Registration(reg.event_id, reg.user_id),
        }
    }

    /// Version of the wrapped record
    #[must_use]
    pub const fn version(&self) -> u64 {
        match self {
            Self::Event(event) => event.version,
            Self::User(user) => user.version,
            Self::Registration(reg) => reg.version,
        }
    }

    /// Overwrite the version of the wrapped record
    pub fn set_version(&mut self, version: u64) {
        match self {
            Self::Event(event) => event.version = version,
            Self::User(user) => user.version = version,
            Self::Registration(reg) => reg.version = version,
        }
    }
}

impl From<Event> for Entity {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

impl From<UserAccount> for Entity {
    fn from(user: UserAccount) -> Self {
        Self::User(user)
    }
}

impl From<Registration> for Entity {
    fn from(reg: Registration) -> Self {
        Self::Registration(reg)
    }
}

/// Typed access to one kind of [`Entity`].
///
/// Lets generic read-modify-write helpers work on concrete record types.
pub trait Record: Clone + Send + Sync + Sized + 'static {
    /// Entity type of this record
    const ENTITY_TYPE: EntityType;

    /// Repository key of this record
    fn key(&self) -> EntityKey;

    /// Optimistic-concurrency version
    fn version(&self) -> u64;

    /// Wrap into the entity envelope
    fn into_entity(self) -> Entity;

    /// Unwrap from the entity envelope, `None` on a type mismatch
    fn from_entity(entity: Entity) -> Option<Self>;
}

impl Record for Event {
    const ENTITY_TYPE: EntityType = EntityType::Event;

    fn key(&self) -> EntityKey {
        EntityKey::Event(self.id)
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn into_entity(self) -> Entity {
        Entity::Event(self)
    }

    fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
            Entity::Event(event) => Some(event),
            _ => None,
        }
    }
}

impl Record for UserAccount {
    const ENTITY_TYPE: EntityType = EntityType::User;

    fn key(&self) -> EntityKey {
        EntityKey::User(self.id)
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn into_entity(self) -> Entity {
        Entity::User(self)
    }

    fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
            Entity::User(user) => Some(user),
            _ => None,
        }
    }
}

impl Record for Registration {
    const ENTITY_TYPE: EntityType = EntityType::Registration;

    fn key(&self) -> EntityKey {
        EntityKey::Registration(self.event_id, self.user_id)
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn into_entity(self) -> Entity {
        Entity::Registration(self)
    }

    fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
            Entity::Registration(reg) => Some(reg),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn event(capacity: u32) -> Event {
        Event {
            id: EventId::new(),
            title: "Robotics Workshop".to_string(),
            description: String::new(),
            date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            location: "Lab 2".to_string(),
            category: Category::Technical,
            capacity,
            attendee_ids: BTreeSet::new(),
            created_at: Utc::now(),
            version: 1,
        }
    }

    #[test]
    fn capacity_remaining_counts_attendees() {
        let mut event = event(3);
        event.attendee_ids.insert(UserId::new());
        assert_eq!(event.capacity_remaining(), 2);
        assert_eq!(event.summary().capacity_remaining, 2);
    }

    #[test]
    fn capacity_remaining_never_underflows() {
        let mut event = event(1);
        event.attendee_ids.insert(UserId::new());
        event.attendee_ids.insert(UserId::new());
        assert_eq!(event.capacity_remaining(), 0);
    }

    #[test]
    fn entity_envelope_round_trips_through_record() {
        let event = event(5);
        let key = Record::key(&event);
        let entity = event.clone().into_entity();
        assert_eq!(entity.key(), key);
        assert_eq!(Event::from_entity(entity.clone()), Some(event));
        assert!(UserAccount::from_entity(entity).is_none());
    }

    #[test]
    fn registration_key_is_composite() {
        let event_id = EventId::new();
        let user_id = UserId::new();
        let key = EntityKey::Registration(event_id, user_id);
        assert_eq!(key.entity_type(), EntityType::Registration);
        assert!(key.to_string().starts_with("registration:"));
    }
}
