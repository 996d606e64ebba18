//! Change-feed payloads and observer visibility.

use crate::entity::{CancelReason, EntityKey, EntityType, RegistrationStatus};
use crate::types::{Caller, Category, EventId, Role, UserId};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Public view of an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    /// Event id
    pub id: EventId,
    /// Title
    pub title: String,
    /// Scheduled date
    pub date: NaiveDate,
    /// Scheduled start time
    pub time: NaiveTime,
    /// Venue
    pub location: String,
    /// Free slots
    pub capacity_remaining: u32,
    /// Category
    pub category: Category,
}

/// View of one registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSummary {
    /// Event
    pub event_id: EventId,
    /// Participant
    pub user_id: UserId,
    /// Status
    pub status: RegistrationStatus,
    /// Per-event commit sequence number
    pub committed_at: u64,
    /// Why the registration was cancelled, if it was
    pub cancel_reason: Option<CancelReason>,
}

/// Roster entry shown to administrators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    /// Account id
    pub id: UserId,
    /// Role
    pub role: Role,
    /// Display name
    pub name: String,
    /// Contact email
    pub email: String,
    /// Institutional identifier
    pub student_id: String,
    /// Department
    pub department: String,
    /// Number of confirmed registrations
    pub registered_count: usize,
}

/// What changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangePayload {
    /// An event was created or modified (including its remaining capacity)
    EventUpserted(EventSummary),
    /// An event was deleted
    EventDeleted(EventId),
    /// A registration was confirmed or cancelled
    Registration(RegistrationSummary),
    /// An account was provisioned or its mirror changed
    UserUpserted(UserSummary),
    /// An account was removed
    UserRemoved(UserId),
}

/// A committed change that has not been assigned a feed position yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeDraft {
    /// Entity the change applies to
    pub entity: EntityKey,
    /// Entity version after the change
    pub version: u64,
    /// What changed
    pub payload: ChangePayload,
}

impl ChangeDraft {
    /// Build a draft
    #[must_use]
    pub const fn new(entity: EntityKey, version: u64, payload: ChangePayload) -> Self {
        Self {
            entity,
            version,
            payload,
        }
    }
}

/// A change as delivered to observers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedChange {
    /// Position in the feed, strictly increasing across all entities
    pub position: u64,
    /// Type of the changed entity
    pub entity_type: EntityType,
    /// Key of the changed entity
    pub entity: EntityKey,
    /// Entity version after the change, strictly increasing per entity
    pub version: u64,
    /// What changed
    pub payload: ChangePayload,
}

/// Which changes an observer may see.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Visibility {
    /// Every feed, including the account roster
    Administrator,
    /// Public event feed plus the participant's own registrations
    Participant(UserId),
}

impl Visibility {
    /// Visibility granted to an authenticated caller
    #[must_use]
    pub const fn for_caller(caller: &Caller) -> Self {
        match caller.role {
            Role::Admin => Self::Administrator,
            Role::Participant => Self::Participant(caller.user_id),
        }
    }

    /// Whether a change to `entity` may be delivered under this filter
    #[must_use]
    pub fn admits(&self, entity: &EntityKey) -> bool {
        match (self, entity) {
            (Self::Administrator, _) | (Self::Participant(_), EntityKey::Event(_)) => true,
            (Self::Participant(me), EntityKey::Registration(_, user_id)) => me == user_id,
            (Self::Participant(_), EntityKey::User(_)) => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn participant_sees_events_and_own_registrations_only() {
        let me = UserId::new();
        let other = UserId::new();
        let event = EventId::new();
        let filter = Visibility::for_caller(&Caller::participant(me));

        assert!(filter.admits(&EntityKey::Event(event)));
        assert!(filter.admits(&EntityKey::Registration(event, me)));
        assert!(!filter.admits(&EntityKey::Registration(event, other)));
        assert!(!filter.admits(&EntityKey::User(me)));
    }

    #[test]
    fn administrator_sees_everything() {
        let filter = Visibility::for_caller(&Caller::admin(UserId::new()));
        assert!(filter.admits(&EntityKey::User(UserId::new())));
        assert!(filter.admits(&EntityKey::Registration(EventId::new(), UserId::new())));
    }

    #[test]
    fn change_wire_format_uses_snake_case_labels() {
        let event_id = EventId::new();
        let user_id = UserId::new();
        let change = VersionedChange {
            position: 7,
            entity_type: EntityType::Registration,
            entity: EntityKey::Registration(event_id, user_id),
            version: 2,
            payload: ChangePayload::Registration(RegistrationSummary {
                event_id,
                user_id,
                status: RegistrationStatus::Cancelled,
                committed_at: 1,
                cancel_reason: Some(CancelReason::EventDeleted),
            }),
        };

        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["entity_type"], "registration");
        assert_eq!(json["payload"]["Registration"]["status"], "cancelled");
        assert_eq!(json["payload"]["Registration"]["cancel_reason"], "event_deleted");

        let decoded: VersionedChange = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, change);
    }
}
