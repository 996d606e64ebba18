//! Registration and cancellation through the coordinator, including mirror
//! write failures and the rollback that follows them.

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use common::harness;
use eventflow::CancelOutcome;
use eventflow_core::{
    Caller, CancelReason, EntityType, RegistrationError, RegistrationStatus, UserId,
};

#[tokio::test]
async fn test_registration_updates_every_view() {
    let h = harness();
    let event_id = h.event(3).await;
    let caller = h.participant("Alan Turing");

    let confirmation = h
        .app
        .coordinator()
        .request_registration(&caller, event_id)
        .await
        .unwrap();
    assert_eq!(confirmation.event_id, event_id);
    assert_eq!(confirmation.user_id, caller.user_id);

    let row = h.stored_row(event_id, caller.user_id).unwrap();
    assert_eq!(row.status, RegistrationStatus::Confirmed);
    assert_eq!(row.committed_at, confirmation.committed_at);
    assert!(h.stored_event(event_id).unwrap().attendee_ids.contains(&caller.user_id));
    assert!(h.stored_user(caller.user_id).unwrap().registered_events.contains(&event_id));
    assert_eq!(h.app.lifecycle().get_event(event_id).await.unwrap().capacity_remaining, 2);
    h.assert_consistent(event_id).await;
}

#[tokio::test]
async fn test_admins_and_unknown_accounts_cannot_register() {
    let h = harness();
    let event_id = h.event(3).await;

    let err = h
        .app
        .coordinator()
        .request_registration(&h.admin, event_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::Unauthorized(_)));

    let ghost = Caller::participant(UserId::new());
    let err = h
        .app
        .coordinator()
        .request_registration(&ghost, event_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::NotFound(EntityType::User, _)));
}

#[tokio::test]
async fn test_registering_for_missing_event_is_not_found() {
    let h = harness();
    let caller = h.participant("Lost");

    let err = h
        .app
        .coordinator()
        .request_registration(&caller, eventflow_core::EventId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::NotFound(EntityType::Event, _)));
}

#[tokio::test]
async fn test_participant_cancels_own_registration() {
    let h = harness();
    let event_id = h.event(1).await;
    let caller = h.participant("Ada Lovelace");
    h.app
        .coordinator()
        .request_registration(&caller, event_id)
        .await
        .unwrap();

    let outcome = h
        .app
        .coordinator()
        .cancel_registration(&caller, event_id, caller.user_id)
        .await
        .unwrap();
    let CancelOutcome::Cancelled(receipt) = outcome else {
        panic!("expected a cancellation, got {outcome:?}");
    };
    assert_eq!(receipt.reason, CancelReason::Participant);
    assert_eq!(receipt.capacity_remaining, 1);

    let row = h.stored_row(event_id, caller.user_id).unwrap();
    assert_eq!(row.status, RegistrationStatus::Cancelled);
    assert_eq!(row.cancel_reason, Some(CancelReason::Participant));
    h.assert_consistent(event_id).await;

    let again = h
        .app
        .coordinator()
        .cancel_registration(&caller, event_id, caller.user_id)
        .await
        .unwrap();
    assert_eq!(again, CancelOutcome::NotRegistered);
}

#[tokio::test]
async fn test_participants_cannot_cancel_for_others() {
    let h = harness();
    let event_id = h.event(2).await;
    let owner = h.participant("Owner");
    let meddler = h.participant("Meddler");
    h.app
        .coordinator()
        .request_registration(&owner, event_id)
        .await
        .unwrap();

    let err = h
        .app
        .coordinator()
        .cancel_registration(&meddler, event_id, owner.user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::Unauthorized(_)));
    assert!(h.stored_row(event_id, owner.user_id).unwrap().is_confirmed());
}

#[tokio::test]
async fn test_administrator_can_force_cancel() {
    let h = harness();
    let event_id = h.event(2).await;
    let caller = h.participant("Participant");
    h.app
        .coordinator()
        .request_registration(&caller, event_id)
        .await
        .unwrap();

    let outcome = h
        .app
        .coordinator()
        .cancel_registration(&h.admin, event_id, caller.user_id)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        CancelOutcome::Cancelled(receipt) if receipt.reason == CancelReason::Administrator
    ));
    h.assert_consistent(event_id).await;
}

#[tokio::test]
async fn test_reregistration_reuses_the_row_with_a_new_sequence() {
    let h = harness();
    let event_id = h.event(2).await;
    let caller = h.participant("Returning");
    let coordinator = h.app.coordinator();

    let first = coordinator.request_registration(&caller, event_id).await.unwrap();
    coordinator
        .cancel_registration(&caller, event_id, caller.user_id)
        .await
        .unwrap();
    let second = coordinator.request_registration(&caller, event_id).await.unwrap();

    assert!(second.committed_at > first.committed_at);
    let row = h.stored_row(event_id, caller.user_id).unwrap();
    assert!(row.is_confirmed());
    assert_eq!(row.cancel_reason, None);
    h.assert_consistent(event_id).await;
}

/// A failed event-mirror write rolls back the row and the account mirror.
#[tokio::test]
async fn test_mirror_failure_rolls_back_and_keeps_slot_free() {
    let h = harness();
    let event_id = h.event(1).await;
    let caller = h.participant("Unlucky");

    h.repo.fail_writes(EntityType::Event, 1);
    let err = h
        .app
        .coordinator()
        .request_registration(&caller, event_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::Internal(_)));

    let row = h.stored_row(event_id, caller.user_id).unwrap();
    assert_eq!(row.cancel_reason, Some(CancelReason::RolledBack));
    assert!(h.stored_user(caller.user_id).unwrap().registered_events.is_empty());
    assert_eq!(h.app.lifecycle().capacity_remaining(event_id).await.unwrap(), 1);
    h.assert_consistent(event_id).await;

    h.app
        .coordinator()
        .request_registration(&caller, event_id)
        .await
        .unwrap();
    h.assert_consistent(event_id).await;
}

#[tokio::test]
async fn test_registered_events_are_listed_newest_first() {
    let h = harness();
    let caller = h.participant("Busy");
    let lifecycle = h.app.lifecycle();

    let mut ids = Vec::new();
    for date in ["2025-01-10", "2025-06-01", "2025-03-05"] {
        let mut draft = common::draft("Dated", 5);
        draft.date = date.to_string();
        ids.push(lifecycle.create_event(&h.admin, draft).await.unwrap().id);
    }
    for event_id in &ids {
        h.app
            .coordinator()
            .request_registration(&caller, *event_id)
            .await
            .unwrap();
    }

    let listed: Vec<_> = h
        .app
        .coordinator()
        .registered_events(&caller)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(listed, vec![ids[1], ids[2], ids[0]]);
}

#[tokio::test]
async fn test_registration_lookup_respects_ownership() {
    let h = harness();
    let event_id = h.event(2).await;
    let owner = h.participant("Owner");
    let other = h.participant("Other");
    h.app
        .coordinator()
        .request_registration(&owner, event_id)
        .await
        .unwrap();

    let own = h
        .app
        .coordinator()
        .registration(&owner, event_id, owner.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(own.status, RegistrationStatus::Confirmed);

    assert!(
        h.app
            .coordinator()
            .registration(&other, event_id, owner.user_id)
            .await
            .is_err()
    );
    assert!(
        h.app
            .coordinator()
            .registration(&h.admin, event_id, owner.user_id)
            .await
            .unwrap()
            .is_some()
    );
}
