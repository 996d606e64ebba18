//! Ledger and registration path benchmarks.
//!
//! - `slot_book`: pure bookkeeping cost of reserve + commit
//! - `registration`: full coordinator path over the in-memory repository
//!
//! Run with: `cargo bench --bench ledger`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::unwrap_used, clippy::expect_used)] // Benchmarks can unwrap during setup

use chrono::{Duration, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use eventflow::lifecycle::EventDraft;
use eventflow::{Config, EventFlowApp, ReserveOutcome, SlotBook};
use eventflow_core::{Caller, EventId, UserId};
use eventflow_testing::{InMemoryRepository, fixtures, test_clock};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn benchmark_slot_book(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_book");
    group.throughput(Throughput::Elements(1));

    let now = Utc::now();
    let ttl = Duration::seconds(10);

    group.bench_function("reserve_commit", |b| {
        b.iter_batched(
            || SlotBook::new(EventId::new(), u32::MAX),
            |mut book| {
                if let ReserveOutcome::Reserved(reservation) =
                    book.reserve(UserId::new(), now, ttl)
                {
                    black_box(book.commit(reservation.id, now));
                }
                book
            },
            criterion::BatchSize::SmallInput,
        );
    });

    for confirmed in [10_u32, 1_000] {
        group.bench_with_input(
            BenchmarkId::new("resize_evict_half", confirmed),
            &confirmed,
            |b, &confirmed| {
                b.iter_batched(
                    || {
                        let mut book = SlotBook::new(EventId::new(), confirmed);
                        for _ in 0..confirmed {
                            book.adopt(UserId::new(), None);
                        }
                        book
                    },
                    |mut book| black_box(book.resize(confirmed / 2)),
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

fn benchmark_registration(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("registration");
    group.throughput(Throughput::Elements(1));

    let repository = InMemoryRepository::new();
    let admin = fixtures::admin("Bench Admin").build();
    let admin_caller = Caller::admin(admin.id);
    repository.seed(admin.into());
    let app = EventFlowApp::new(
        Config::default(),
        Arc::new(repository.clone()),
        Arc::new(test_clock()),
    );

    let event_id = runtime.block_on(async {
        app.lifecycle()
            .create_event(
                &admin_caller,
                EventDraft {
                    title: "Benchmark".to_string(),
                    description: String::new(),
                    date: "2025-03-14".to_string(),
                    time: "10:00".to_string(),
                    location: "Hall".to_string(),
                    category: "technical".to_string(),
                    capacity: i64::from(u32::MAX),
                },
            )
            .await
            .expect("create event")
            .id
    });

    group.bench_function("register_then_cancel", |b| {
        b.to_async(&runtime).iter_batched(
            || {
                let user = fixtures::participant("Bench User").build();
                let caller = Caller::participant(user.id);
                repository.seed(user.into());
                caller
            },
            |caller| {
                let app = &app;
                async move {
                    app.coordinator()
                        .request_registration(&caller, event_id)
                        .await
                        .unwrap();
                    app.coordinator()
                        .cancel_registration(&caller, event_id, caller.user_id)
                        .await
                        .unwrap();
                }
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, benchmark_slot_book, benchmark_registration);
criterion_main!(benches);
