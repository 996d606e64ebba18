//! Reconciliation of states a crash between mirror writes can leave behind.
//!
//! Each test seeds a store that breaks one agreement between the registration
//! rows, the event mirror and the account mirrors, runs a pass, and checks
//! that the store is consistent and a second pass finds nothing to do.

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use common::{Harness, harness_over, test_config};
use eventflow_core::{CancelReason, EntityKey, EventId};
use eventflow_testing::{InMemoryRepository, fixtures};

async fn settle(h: &Harness, event_id: Option<EventId>) {
    let report = h.app.synchronizer().reconcile().await.unwrap();
    assert!(report.repairs > 0, "expected repairs, got {report:?}");
    assert!(report.skipped.is_empty());
    if let Some(event_id) = event_id {
        h.assert_consistent(event_id).await;
    }

    let second = h.app.synchronizer().reconcile().await.unwrap();
    assert!(second.is_clean(), "second pass not clean: {second:?}");
}

/// Row and account mirror written, event mirror missing the attendee.
#[tokio::test]
async fn test_missing_attendee_is_restored() {
    let store = InMemoryRepository::new();
    let event = fixtures::event().capacity(2).build();
    let user = fixtures::participant("Interrupted").registered([event.id]).build();
    store.seed(fixtures::registration(event.id, user.id).committed_at(1).build().into());
    let (event_id, user_id) = (event.id, user.id);
    store.seed(event.into());
    store.seed(user.into());

    let h = harness_over(store, test_config());
    settle(&h, Some(event_id)).await;

    assert!(h.stored_event(event_id).unwrap().attendee_ids.contains(&user_id));
    assert_eq!(h.app.lifecycle().capacity_remaining(event_id).await.unwrap(), 1);
}

/// Attendee listed without a row: the registration is completed.
#[tokio::test]
async fn test_attendee_without_row_is_completed() {
    let store = InMemoryRepository::new();
    let user = fixtures::participant("Half Written").build();
    let event = fixtures::event().capacity(2).attendees([user.id]).build();
    let (event_id, user_id) = (event.id, user.id);
    store.seed(event.into());
    store.seed(user.into());

    let h = harness_over(store, test_config());
    settle(&h, Some(event_id)).await;

    assert!(h.stored_row(event_id, user_id).unwrap().is_confirmed());
    assert!(h.stored_user(user_id).unwrap().registered_events.contains(&event_id));
}

/// Attendee listed for an account that no longer exists.
#[tokio::test]
async fn test_stale_attendee_is_removed() {
    let store = InMemoryRepository::new();
    let gone = fixtures::participant("Gone").build();
    let event = fixtures::event().capacity(2).attendees([gone.id]).build();
    let event_id = event.id;
    store.seed(event.into());

    let h = harness_over(store, test_config());
    settle(&h, Some(event_id)).await;

    assert!(h.stored_event(event_id).unwrap().attendee_ids.is_empty());
    assert_eq!(h.app.lifecycle().capacity_remaining(event_id).await.unwrap(), 2);
}

/// More confirmed registrations than slots: the latest commits lose.
#[tokio::test]
async fn test_oversubscription_keeps_earliest_commits() {
    let store = InMemoryRepository::new();
    let early = fixtures::participant("Early").build();
    let late = fixtures::participant("Late").build();
    let event = fixtures::event()
        .capacity(1)
        .attendees([early.id, late.id])
        .build();
    let (event_id, early_id, late_id) = (event.id, early.id, late.id);
    store.seed(fixtures::registration(event_id, early_id).committed_at(1).build().into());
    store.seed(fixtures::registration(event_id, late_id).committed_at(2).build().into());
    store.seed(event.into());
    store.seed(fixtures::participant("Early").id(early_id).registered([event_id]).build().into());
    store.seed(fixtures::participant("Late").id(late_id).registered([event_id]).build().into());

    let h = harness_over(store, test_config());
    settle(&h, Some(event_id)).await;

    assert!(h.stored_row(event_id, early_id).unwrap().is_confirmed());
    let late_row = h.stored_row(event_id, late_id).unwrap();
    assert_eq!(late_row.cancel_reason, Some(CancelReason::Reconciled));
    assert!(h.stored_user(late_id).unwrap().registered_events.is_empty());
}

/// Registrations pointing at an event that was deleted mid-cascade.
#[tokio::test]
async fn test_registrations_of_deleted_event_are_cancelled() {
    let store = InMemoryRepository::new();
    let deleted = EventId::new();
    let user = fixtures::participant("Orphaned").registered([deleted]).build();
    let user_id = user.id;
    store.seed(fixtures::registration(deleted, user_id).build().into());
    store.seed(user.into());

    let h = harness_over(store, test_config());
    settle(&h, None).await;

    let row = h.stored_row(deleted, user_id).unwrap();
    assert_eq!(row.cancel_reason, Some(CancelReason::EventDeleted));
    assert!(h.stored_user(user_id).unwrap().registered_events.is_empty());
}

/// A consistent store needs no repairs and publishes nothing.
#[tokio::test]
async fn test_consistent_store_is_left_alone() {
    let h = common::harness();
    let event_id = h.event(2).await;
    let caller = h.participant("Settled");
    h.app
        .coordinator()
        .request_registration(&caller, event_id)
        .await
        .unwrap();
    let writes = h.store().write_count();

    let report = h.app.synchronizer().reconcile().await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.events_scanned, 1);
    assert_eq!(report.changes_published, 0);
    assert_eq!(h.store().write_count(), writes);
}

/// Repairs reach observers like any other change.
#[tokio::test]
async fn test_repairs_are_published() {
    let store = InMemoryRepository::new();
    let user = fixtures::participant("Observed").build();
    let event = fixtures::event().capacity(2).attendees([user.id]).build();
    let event_id = event.id;
    store.seed(event.into());
    store.seed(user.into());

    let h = harness_over(store, test_config());
    let mut observer = h
        .app
        .notifier()
        .subscribe(
            eventflow_core::SessionId::new(),
            h.admin,
            eventflow::ResumeFrom::Latest,
        )
        .unwrap();

    let report = h.app.synchronizer().reconcile().await.unwrap();
    let delivered = observer.drain();
    assert_eq!(delivered.len(), report.changes_published);
    assert!(
        delivered
            .iter()
            .any(|change| match change.entity {
                EntityKey::Event(e) | EntityKey::Registration(e, _) => e == event_id,
                EntityKey::User(_) => false,
            })
    );
}
