//! Shared harness for the registration integration tests.

#![allow(dead_code)] // Not every test binary uses every helper
#![allow(clippy::unwrap_used, clippy::panic)]

use eventflow::config::{Config, RetryConfig};
use eventflow::{EventDraft, EventFlowApp};
use eventflow_core::{
    Caller, Entity, EntityKey, EntityType, Event, EventId, Registration, Repository, UserAccount,
    UserId,
};
use eventflow_testing::{FaultyRepository, InMemoryRepository, ManualClock, fixtures, helpers};
use std::collections::BTreeSet;
use std::sync::Arc;

/// An app over a fault-injectable in-memory store and a manual clock.
pub struct Harness {
    pub app: Arc<EventFlowApp>,
    pub repo: FaultyRepository,
    pub clock: ManualClock,
    pub admin: Caller,
}

/// Retry quickly so contention tests stay fast.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry = RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 10,
    };
    config
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: Config) -> Harness {
    helpers::init_tracing();
    harness_over(InMemoryRepository::new(), config)
}

/// Build the app over a store that may already hold records.
pub fn harness_over(store: InMemoryRepository, config: Config) -> Harness {
    let admin = fixtures::admin("Ada Admin").build();
    let caller = Caller::admin(admin.id);
    store.seed(admin.into());

    let repo = FaultyRepository::new(store);
    let clock = ManualClock::starting_at_epoch();
    let app = EventFlowApp::new(config, Arc::new(repo.clone()), Arc::new(clock.clone()));

    Harness {
        app: Arc::new(app),
        repo,
        clock,
        admin: caller,
    }
}

pub fn draft(title: &str, capacity: i64) -> EventDraft {
    EventDraft {
        title: title.to_string(),
        description: "Integration test event".to_string(),
        date: "2025-03-14".to_string(),
        time: "10:00".to_string(),
        location: "Main Hall".to_string(),
        category: "technical".to_string(),
        capacity,
    }
}

impl Harness {
    pub fn store(&self) -> &InMemoryRepository {
        self.repo.inner()
    }

    /// Seed a participant account and return its caller.
    pub fn participant(&self, name: &str) -> Caller {
        let user = fixtures::participant(name).build();
        let caller = Caller::participant(user.id);
        self.store().seed(user.into());
        caller
    }

    pub fn participants(&self, count: usize) -> Vec<Caller> {
        (0..count)
            .map(|i| self.participant(&format!("Participant {i}")))
            .collect()
    }

    /// Create an event through the lifecycle manager.
    pub async fn event(&self, capacity: i64) -> EventId {
        self.app
            .lifecycle()
            .create_event(&self.admin, draft("Rust Workshop", capacity))
            .await
            .unwrap()
            .id
    }

    pub fn stored_event(&self, event_id: EventId) -> Option<Event> {
        match self.store().get(&EntityKey::Event(event_id)) {
            Some(Entity::Event(event)) => Some(event),
            _ => None,
        }
    }

    pub fn stored_user(&self, user_id: UserId) -> Option<UserAccount> {
        match self.store().get(&EntityKey::User(user_id)) {
            Some(Entity::User(user)) => Some(user),
            _ => None,
        }
    }

    pub fn stored_row(&self, event_id: EventId, user_id: UserId) -> Option<Registration> {
        match self.store().get(&EntityKey::Registration(event_id, user_id)) {
            Some(Entity::Registration(row)) => Some(row),
            _ => None,
        }
    }

    pub async fn users(&self) -> Vec<UserAccount> {
        self.store()
            .list(EntityType::User)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::User(user) => Some(user),
                _ => None,
            })
            .collect()
    }

    /// Users with a confirmed registration row for `event_id`.
    pub async fn confirmed_rows(&self, event_id: EventId) -> BTreeSet<UserId> {
        self.store()
            .list(EntityType::Registration)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::Registration(row) if row.event_id == event_id && row.is_confirmed() => {
                    Some(row.user_id)
                }
                _ => None,
            })
            .collect()
    }

    /// Check that the event mirror, the user mirrors, the registration rows
    /// and the ledger agree, and that capacity holds.
    pub async fn assert_consistent(&self, event_id: EventId) {
        let event = self.stored_event(event_id).unwrap();
        let rows = self.confirmed_rows(event_id).await;

        assert!(
            event.attendee_ids.len() <= event.capacity as usize,
            "attendees {} exceed capacity {}",
            event.attendee_ids.len(),
            event.capacity
        );
        assert_eq!(event.attendee_ids, rows, "event mirror disagrees with rows");

        for user in self.users().await {
            assert_eq!(
                user.registered_events.contains(&event_id),
                rows.contains(&user.id),
                "user mirror of {} disagrees with rows",
                user.id
            );
        }

        let snapshot = self.app.ledger().snapshot(event_id).await.unwrap();
        let ledger: BTreeSet<UserId> = snapshot.confirmed.iter().map(|e| e.user_id).collect();
        assert_eq!(ledger, rows, "ledger disagrees with rows");
        assert_eq!(snapshot.capacity, event.capacity);
    }
}
