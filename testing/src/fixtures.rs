//! Fixture builders for events, accounts and registrations.
//!
//! Built records carry version `0`; the repository assigns the real version
//! when they are written or seeded.

use crate::mocks::test_clock;
use chrono::{NaiveDate, NaiveTime};
use eventflow_core::entity::{
    CancelReason, Event, Registration, RegistrationStatus, UserAccount,
};
use eventflow_core::environment::Clock;
use eventflow_core::types::{Category, EventId, Role, UserId};
use std::collections::BTreeSet;

/// Start building an event (capacity 10, technical, 2025-03-14 10:00)
#[must_use]
pub fn event() -> EventBuilder {
    EventBuilder {
        event: Event {
            id: EventId::new(),
            title: "Intro to Rust".to_string(),
            description: "Hands-on workshop".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap_or_default(),
            time: NaiveTime::from_hms_opt(10, 0, 0).unwrap_or_default(),
            location: "Main Hall".to_string(),
            category: Category::Technical,
            capacity: 10,
            attendee_ids: BTreeSet::new(),
            created_at: test_clock().now(),
            version: 0,
        },
    }
}

/// Builder returned by [`event`]
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    /// Use a specific id
    #[must_use]
    pub const fn id(mut self, id: EventId) -> Self {
        self.event.id = id;
        self
    }

    /// Set the title
    #[must_use]
    pub fn title(mut self, title: &str) -> Self {
        self.event.title = title.to_string();
        self
    }

    /// Set the capacity
    #[must_use]
    pub const fn capacity(mut self, capacity: u32) -> Self {
        self.event.capacity = capacity;
        self
    }

    /// Set the scheduled date
    #[must_use]
    pub const fn date(mut self, date: NaiveDate) -> Self {
        self.event.date = date;
        self
    }

    /// Set the scheduled time
    #[must_use]
    pub const fn time(mut self, time: NaiveTime) -> Self {
        self.event.time = time;
        self
    }

    /// Set the category
    #[must_use]
    pub const fn category(mut self, category: Category) -> Self {
        self.event.category = category;
        self
    }

    /// Add confirmed attendees
    #[must_use]
    pub fn attendees(mut self, attendees: impl IntoIterator<Item = UserId>) -> Self {
        self.event.attendee_ids.extend(attendees);
        self
    }

    /// Finish
    #[must_use]
    pub fn build(self) -> Event {
        self.event
    }
}

/// Start building a participant account
#[must_use]
pub fn participant(name: &str) -> UserBuilder {
    UserBuilder::new(name, Role::Participant)
}

/// Start building an administrator account
#[must_use]
pub fn admin(name: &str) -> UserBuilder {
    UserBuilder::new(name, Role::Admin)
}

/// Builder returned by [`participant`] and [`admin`]
#[derive(Debug, Clone)]
pub struct UserBuilder {
    user: UserAccount,
}

impl UserBuilder {
    fn new(name: &str, role: Role) -> Self {
        let slug = name.to_ascii_lowercase().replace(' ', ".");
        Self {
            user: UserAccount {
                id: UserId::new(),
                role,
                name: name.to_string(),
                email: format!("{slug}@campus.test"),
                student_id: format!("S-{slug}"),
                department: "Computer Science".to_string(),
                registered_events: BTreeSet::new(),
                created_at: test_clock().now(),
                version: 0,
            },
        }
    }

    /// Use a specific id
    #[must_use]
    pub const fn id(mut self, id: UserId) -> Self {
        self.user.id = id;
        self
    }

    /// Mark events as registered in the account mirror
    #[must_use]
    pub fn registered(mut self, events: impl IntoIterator<Item = EventId>) -> Self {
        self.user.registered_events.extend(events);
        self
    }

    /// Finish
    #[must_use]
    pub fn build(self) -> UserAccount {
        self.user
    }
}

/// Start building a confirmed registration
#[must_use]
pub fn registration(event_id: EventId, user_id: UserId) -> RegistrationBuilder {
    RegistrationBuilder {
        registration: Registration {
            event_id,
            user_id,
            status: RegistrationStatus::Confirmed,
            committed_at: 1,
            cancel_reason: None,
            updated_at: test_clock().now(),
            version: 0,
        },
    }
}

/// Builder returned by [`registration`]
#[derive(Debug, Clone)]
pub struct RegistrationBuilder {
    registration: Registration,
}

impl RegistrationBuilder {
    /// Set the commit sequence number
    #[must_use]
    pub const fn committed_at(mut self, seq: u64) -> Self {
        self.registration.committed_at = seq;
        self
    }

    /// Mark as cancelled
    #[must_use]
    pub const fn cancelled(mut self, reason: CancelReason) -> Self {
        self.registration.status = RegistrationStatus::Cancelled;
        self.registration.cancel_reason = Some(reason);
        self
    }

    /// Finish
    #[must_use]
    pub fn build(self) -> Registration {
        self.registration
    }
}
