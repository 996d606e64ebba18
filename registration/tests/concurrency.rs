//! Concurrency tests for last-slot races.
//!
//! Many participants hit the same event at once; the ledger must admit
//! exactly as many as there are slots, and every mirror must agree afterwards.
//!
//! Run with: `cargo test --test concurrency -- --nocapture`

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use chrono::Duration;
use common::{harness, harness_with, test_config};
use eventflow::{CommitOutcome, ReserveOutcome};
use eventflow_core::{ConflictKind, EntityType, RegistrationError};
use std::sync::Arc;

/// 50 participants race for 5 slots: exactly 5 win, the rest see a full event.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_slot_race_admits_exactly_capacity() {
    let h = harness();
    let event_id = h.event(5).await;
    let callers = h.participants(50);

    let mut handles = Vec::new();
    for caller in callers {
        let app = Arc::clone(&h.app);
        handles.push(tokio::spawn(async move {
            app.coordinator().request_registration(&caller, event_id).await
        }));
    }

    let mut confirmed = Vec::new();
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(confirmation) => confirmed.push(confirmation),
            Err(e) if e.is_capacity_exceeded() => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    println!("confirmed {}, rejected {rejected}", confirmed.len());
    assert_eq!(confirmed.len(), 5);
    assert_eq!(rejected, 45);

    let mut seqs: Vec<u64> = confirmed.iter().map(|c| c.committed_at).collect();
    seqs.sort_unstable();
    seqs.dedup();
    assert_eq!(seqs.len(), 5, "commit sequence numbers must be unique");

    assert_eq!(h.app.lifecycle().capacity_remaining(event_id).await.unwrap(), 0);
    h.assert_consistent(event_id).await;
}

/// The same participant submitting ten times at once is registered once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_submissions_register_once() {
    let h = harness();
    let event_id = h.event(3).await;
    let caller = h.participant("Grace Hopper");

    let mut handles = Vec::new();
    for _ in 0..10 {
        let app = Arc::clone(&h.app);
        handles.push(tokio::spawn(async move {
            app.coordinator().request_registration(&caller, event_id).await
        }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(e.is_duplicate(), "unexpected error: {e}"),
        }
    }

    assert_eq!(ok, 1);
    assert_eq!(h.app.lifecycle().capacity_remaining(event_id).await.unwrap(), 2);
    h.assert_consistent(event_id).await;
}

/// A cancellation racing a registration for the last slot never oversubscribes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_and_register_race_on_full_event() {
    let h = harness();
    let event_id = h.event(1).await;
    let holder = h.participant("Holder");
    let challenger = h.participant("Challenger");
    h.app
        .coordinator()
        .request_registration(&holder, event_id)
        .await
        .unwrap();

    let cancel = {
        let app = Arc::clone(&h.app);
        tokio::spawn(async move {
            app.coordinator()
                .cancel_registration(&holder, event_id, holder.user_id)
                .await
        })
    };
    let register = {
        let app = Arc::clone(&h.app);
        tokio::spawn(async move {
            app.coordinator()
                .request_registration(&challenger, event_id)
                .await
        })
    };

    cancel.await.unwrap().unwrap();
    match register.await.unwrap() {
        Ok(_) | Err(RegistrationError::Conflict(ConflictKind::CapacityExceeded)) => {}
        Err(e) => panic!("unexpected error: {e}"),
    }

    h.assert_consistent(event_id).await;
}

/// Registrations for different events do not block each other.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_events_fill_in_parallel() {
    let h = harness();
    let first = h.event(10).await;
    let second = h.event(10).await;
    let callers = h.participants(20);

    let mut handles = Vec::new();
    for (i, caller) in callers.into_iter().enumerate() {
        let app = Arc::clone(&h.app);
        let event_id = if i % 2 == 0 { first } else { second };
        handles.push(tokio::spawn(async move {
            app.coordinator().request_registration(&caller, event_id).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for event_id in [first, second] {
        assert_eq!(h.app.lifecycle().capacity_remaining(event_id).await.unwrap(), 0);
        h.assert_consistent(event_id).await;
    }
}

/// An uncommitted hold occupies a slot until its lease lapses.
#[tokio::test]
async fn test_lapsed_hold_frees_its_slot() {
    let h = harness();
    let event_id = h.event(1).await;
    let idle = h.participant("Idle");
    let late = h.participant("Late");

    let ReserveOutcome::Reserved(hold) = h
        .app
        .ledger()
        .try_reserve_slot(event_id, idle.user_id)
        .await
        .unwrap()
    else {
        panic!("expected a hold");
    };

    let blocked = h
        .app
        .coordinator()
        .request_registration(&late, event_id)
        .await
        .unwrap_err();
    assert!(blocked.is_capacity_exceeded());

    h.clock.advance(Duration::seconds(11));
    assert_eq!(h.app.ledger().sweep_expired(), 1);
    assert_eq!(
        h.app.ledger().commit_reservation(&hold).await.unwrap(),
        CommitOutcome::LeaseExpired
    );

    h.app
        .coordinator()
        .request_registration(&late, event_id)
        .await
        .unwrap();
    h.assert_consistent(event_id).await;
}

/// A mirror write that outlives the lease is rolled back and retried until
/// the retry budget runs out.
#[tokio::test]
async fn test_slow_mirror_write_reports_temporary_unavailability() {
    let mut config = test_config();
    config.ledger.lease_ttl_ms = 30;
    let h = harness_with(config);
    let event_id = h.event(2).await;
    let caller = h.participant("Patient");

    h.repo
        .delay_writes(EntityType::Event, std::time::Duration::from_millis(200));
    let err = h
        .app
        .coordinator()
        .request_registration(&caller, event_id)
        .await
        .unwrap_err();
    assert_eq!(err, RegistrationError::TemporaryUnavailable { attempts: 3 });

    h.repo.heal();
    let row = h.stored_row(event_id, caller.user_id).unwrap();
    assert!(!row.is_confirmed());
    assert_eq!(h.app.lifecycle().capacity_remaining(event_id).await.unwrap(), 2);
    h.assert_consistent(event_id).await;
}
