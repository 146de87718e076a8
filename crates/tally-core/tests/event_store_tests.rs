//! Integration tests for `EventStore` over the in-memory repository.

use std::sync::{Arc, Mutex};

use chrono::Duration;
use serde_json::{Value, json};
use tally_core::error::StoreError;
use tally_core::event::Event;
use tally_core::projection::{Projection, ProjectionStatus, Replay};
use tally_core::store::EventStore;
use tally_test_support::{FailingEventRepository, FixedClock, InMemoryEventRepository, fixed_time};
use uuid::Uuid;

fn new_store() -> (EventStore, InMemoryEventRepository) {
    let clock = Arc::new(FixedClock::default());
    let repo = InMemoryEventRepository::with_clock(clock.clone());
    let store = EventStore::new(Arc::new(repo.clone())).with_clock(clock);
    (store, repo)
}

fn order_event(event_type: &str, amount: i64, version: i64) -> Event {
    Event::from_json(event_type, json!({ "amount": amount }), version)
        .unwrap()
        .with_occurred_at(fixed_time() - Duration::minutes(1))
}

fn add_amount(total: &i64, event: &Event) -> i64 {
    total
        + event
            .field("amount")
            .and_then(Value::as_i64)
            .unwrap_or_default()
}

async fn push_all(store: &EventStore, stream_id: Uuid, amounts: &[i64]) {
    for (amount, version) in amounts.iter().zip(1_i64..) {
        store
            .push(stream_id, order_event("OrderPlaced", *amount, version))
            .await
            .unwrap();
    }
}

// --- append protocol ---

#[tokio::test]
async fn test_order_scenario_rejects_stale_version_then_accepts_next() {
    // Arrange
    let (store, _repo) = new_store();
    let stream = store.create_stream("Order").await.unwrap();

    // Act
    let first = store
        .push(stream.id, order_event("OrderPlaced", 100, 1))
        .await
        .unwrap();
    let stale = store
        .push(stream.id, order_event("OrderPlaced", 100, 1))
        .await;
    let second = store
        .push(stream.id, order_event("OrderShipped", 0, 2))
        .await
        .unwrap();

    // Assert
    assert_eq!(first.recorded_at(), Some(fixed_time()));
    assert_eq!(first.stream_id(), Some(stream.id));
    match stale {
        Err(StoreError::ConcurrencyConflict {
            stream_id,
            expected,
            observed,
        }) => {
            assert_eq!(stream_id, stream.id);
            assert_eq!(expected, 0);
            assert_eq!(observed, 1);
        }
        other => panic!("expected ConcurrencyConflict, got {other:?}"),
    }
    assert_eq!(second.version(), 2);
    assert_eq!(store.get_version_for_stream(stream.id).await.unwrap(), 2);

    let loaded = store.get_stream(stream.id).await.unwrap();
    assert_eq!(loaded.updated_at, Some(fixed_time()));
    assert!(loaded.is_consistent());
}

#[tokio::test]
async fn test_n_appends_produce_gap_free_versions() {
    let (store, _repo) = new_store();
    let stream = store.create_stream("Order").await.unwrap();

    push_all(&store, stream.id, &[10, 20, 30, 40, 50]).await;

    let events = store.get_events_by_stream(stream.id).await.unwrap();
    let versions: Vec<i64> = events.iter().map(Event::version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    assert_eq!(store.get_version_for_stream(stream.id).await.unwrap(), 5);
}

#[tokio::test]
async fn test_wrong_version_leaves_stream_unchanged() {
    // Arrange
    let (store, repo) = new_store();
    let stream = store.create_stream("Order").await.unwrap();
    push_all(&store, stream.id, &[10, 20]).await;

    // Act
    let ahead = store
        .push(stream.id, order_event("OrderPlaced", 1, 5))
        .await;
    let behind = store
        .push(stream.id, order_event("OrderPlaced", 1, 2))
        .await;

    // Assert
    for result in [ahead, behind] {
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { observed: 2, .. })
        ));
    }
    assert_eq!(store.get_version_for_stream(stream.id).await.unwrap(), 2);
    assert_eq!(repo.event_count().await, 2);
}

#[tokio::test]
async fn test_versions_below_one_are_rejected() {
    // Arrange
    let (store, repo) = new_store();
    let stream = store.create_stream("Order").await.unwrap();

    // Act
    let zero = store
        .push(stream.id, order_event("OrderPlaced", 1, 0))
        .await;
    let minimum = store
        .push(stream.id, order_event("OrderPlaced", 1, i64::MIN))
        .await;

    // Assert
    for result in [zero, minimum] {
        assert!(
            matches!(result, Err(StoreError::Validation(_))),
            "got {result:?}"
        );
    }
    assert_eq!(store.get_version_for_stream(stream.id).await.unwrap(), 0);
    assert_eq!(repo.event_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pushes_from_same_version_have_single_winner() {
    // Arrange
    let (store, _repo) = new_store();
    let store = Arc::new(store);
    let stream_id = store.create_stream("Order").await.unwrap().id;

    // Act
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .push(stream_id, order_event("OrderPlaced", i, 1))
                    .await
            })
        })
        .collect();
    let mut wins = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(StoreError::ConcurrencyConflict { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    // Assert
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 7);
    let events = store.get_events_by_stream(stream_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].version(), 1);
}

#[tokio::test]
async fn test_push_to_unknown_stream_is_not_found() {
    let (store, repo) = new_store();
    let missing = Uuid::new_v4();

    let result = store
        .push(missing, order_event("OrderPlaced", 1, 1))
        .await;

    match result {
        Err(StoreError::StreamNotFound(id)) => assert_eq!(id, missing),
        other => panic!("expected StreamNotFound, got {other:?}"),
    }
    assert_eq!(repo.event_count().await, 0);
}

#[tokio::test]
async fn test_recorded_event_cannot_be_pushed_again() {
    let (store, _repo) = new_store();
    let a = store.create_stream("Order").await.unwrap();
    let b = store.create_stream("Order").await.unwrap();
    let recorded = store
        .push(a.id, order_event("OrderPlaced", 1, 1))
        .await
        .unwrap();

    let result = store.push(b.id, recorded).await;

    assert!(matches!(result, Err(StoreError::Validation(_))));
    assert_eq!(store.get_version_for_stream(b.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_recorded_at_never_precedes_occurred_at() {
    let (store, _repo) = new_store();
    let stream = store.create_stream("Order").await.unwrap();
    let future = fixed_time() + Duration::hours(1);
    let event = Event::from_json("OrderPlaced", json!({}), 1)
        .unwrap()
        .with_occurred_at(future);

    let recorded = store.push(stream.id, event).await.unwrap();

    assert_eq!(recorded.recorded_at(), Some(future));
}

#[tokio::test]
async fn test_storage_failure_surfaces_as_storage_error() {
    let store = EventStore::new(Arc::new(FailingEventRepository));

    let create = store.create_stream("Order").await;
    let push = store
        .push(Uuid::new_v4(), order_event("OrderPlaced", 1, 1))
        .await;

    assert!(matches!(create, Err(StoreError::Storage(_))));
    assert!(matches!(push, Err(StoreError::Storage(_))));
}

// --- rollback / delete ---

#[tokio::test]
async fn test_rollback_removes_only_the_tail_event() {
    // Arrange
    let (store, _repo) = new_store();
    let stream = store.create_stream("Order").await.unwrap();
    push_all(&store, stream.id, &[10, 20, 30]).await;
    let events = store.get_events_by_stream(stream.id).await.unwrap();

    // Act
    let non_tail = store.rollback(stream.id, &events[1]).await.unwrap();
    let version_after_non_tail = store.get_version_for_stream(stream.id).await.unwrap();
    let tail = store.rollback(stream.id, &events[2]).await.unwrap();

    // Assert
    assert!(!non_tail);
    assert_eq!(version_after_non_tail, 3);
    assert!(tail);
    let remaining = store.get_events_by_stream(stream.id).await.unwrap();
    assert_eq!(remaining, events[..2].to_vec());
    assert_eq!(store.get_version_for_stream(stream.id).await.unwrap(), 2);

    let next = store
        .push(stream.id, order_event("OrderPlaced", 99, 3))
        .await;
    assert!(next.is_ok());
}

#[tokio::test]
async fn test_rollback_ignores_event_from_another_stream() {
    let (store, _repo) = new_store();
    let a = store.create_stream("Order").await.unwrap();
    let b = store.create_stream("Order").await.unwrap();
    push_all(&store, a.id, &[1]).await;
    push_all(&store, b.id, &[2]).await;
    let a_tail = store.get_events_by_stream(a.id).await.unwrap().remove(0);

    let applied = store.rollback(b.id, &a_tail).await.unwrap();

    assert!(!applied);
    assert_eq!(store.get_version_for_stream(a.id).await.unwrap(), 1);
    assert_eq!(store.get_version_for_stream(b.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_delete_stream_only_when_empty() {
    let (store, repo) = new_store();
    let empty = store.create_stream("Order").await.unwrap();
    let used = store.create_stream("Order").await.unwrap();
    push_all(&store, used.id, &[5]).await;

    let deleted_empty = store.delete_stream(empty.id).await.unwrap();
    let deleted_used = store.delete_stream(used.id).await.unwrap();

    assert!(deleted_empty);
    assert!(!deleted_used);
    assert!(matches!(
        store.get_stream(empty.id).await,
        Err(StoreError::StreamNotFound(_))
    ));
    assert_eq!(repo.stream_count().await, 1);
}

// --- replay ---

#[tokio::test]
async fn test_exec_by_stream_folds_only_that_stream() {
    let (store, _repo) = new_store();
    let a = store.create_stream("Order").await.unwrap();
    let b = store.create_stream("Order").await.unwrap();
    push_all(&store, a.id, &[10, 20]).await;
    push_all(&store, b.id, &[1000]).await;
    let projection = Projection::for_stream(a.id)
        .on("OrderPlaced", add_amount)
        .build();

    let replay = store.exec(&projection).await.unwrap();

    assert_eq!(replay, Replay::Single(30));
    assert_eq!(projection.position(), 0);
}

#[tokio::test]
async fn test_exec_separate_and_merged_aggregate_differently() {
    // Arrange
    let (store, _repo) = new_store();
    let s1 = store.create_stream("Order").await.unwrap();
    let s2 = store.create_stream("Order").await.unwrap();
    let other = store.create_stream("Invoice").await.unwrap();
    push_all(&store, s1.id, &[1, 2]).await;
    push_all(&store, s2.id, &[4]).await;
    push_all(&store, other.id, &[1000]).await;

    let merged = Projection::for_stream_type("Order")
        .on("OrderPlaced", |seen: &Vec<i64>, e: &Event| {
            let mut seen = seen.clone();
            seen.push(add_amount(&0, e));
            seen
        })
        .build();
    let separate = Projection::for_stream_type("Order")
        .separate(true)
        .on("OrderPlaced", |seen: &Vec<i64>, e: &Event| {
            let mut seen = seen.clone();
            seen.push(add_amount(&0, e));
            seen
        })
        .build();

    // Act
    let merged_state = store.exec(&merged).await.unwrap().into_single().unwrap();
    let per_stream = store
        .exec(&separate)
        .await
        .unwrap()
        .into_per_stream()
        .unwrap();

    // Assert
    assert_eq!(merged_state, vec![1, 2, 4]);
    assert_eq!(per_stream.len(), 2);
    assert_eq!(per_stream.get_index(0), Some((&s1.id, &vec![1, 2])));
    assert_eq!(per_stream.get_index(1), Some((&s2.id, &vec![4])));
}

#[tokio::test]
async fn test_exec_is_deterministic() {
    let (store, _repo) = new_store();
    let stream = store.create_stream("Order").await.unwrap();
    push_all(&store, stream.id, &[3, 5, 8]).await;
    let projection = Projection::global()
        .initial_state(100_i64)
        .on("OrderPlaced", add_amount)
        .build();

    let first = store.exec(&projection).await.unwrap();
    let second = store.exec(&projection).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, Replay::Single(116));
}

#[tokio::test]
async fn test_exec_unknown_stream_is_not_found() {
    let (store, _repo) = new_store();
    let projection = Projection::<i64>::for_stream(Uuid::new_v4()).build();

    let result = store.exec(&projection).await;

    assert!(matches!(result, Err(StoreError::StreamNotFound(_))));
}

#[tokio::test]
async fn test_exec_reports_failure_position() {
    let (store, _repo) = new_store();
    let stream = store.create_stream("Order").await.unwrap();
    push_all(&store, stream.id, &[10, -5, 7]).await;
    let projection = Projection::for_stream(stream.id)
        .try_on("OrderPlaced", |total: &i64, e: &Event| {
            let next = add_amount(total, e);
            if next < *total {
                Err("negative amount")
            } else {
                Ok(next)
            }
        })
        .build();

    let result = store.exec(&projection).await;

    match result {
        Err(StoreError::HandlerFailure {
            position,
            event_id,
            ..
        }) => {
            let events = store.get_events_by_stream(stream.id).await.unwrap();
            assert_eq!(position, 1);
            assert_eq!(event_id, events[1].id());
        }
        other => panic!("expected HandlerFailure, got {other:?}"),
    }
}

// --- live projections ---

#[tokio::test]
async fn test_live_projections_follow_matching_appends() {
    // Arrange
    let (store, _repo) = new_store();
    let order = store.create_stream("Order").await.unwrap();
    let invoice = store.create_stream("Invoice").await.unwrap();

    let by_stream = store.subscribe(
        Projection::for_stream(order.id)
            .on("OrderPlaced", add_amount)
            .build(),
    );
    let by_type = store.subscribe(
        Projection::for_stream_type("Invoice")
            .on("OrderPlaced", add_amount)
            .build(),
    );
    let global = store.subscribe(Projection::global().on("OrderPlaced", add_amount).build());

    // Act
    push_all(&store, order.id, &[10, 20]).await;
    push_all(&store, invoice.id, &[5]).await;

    // Assert
    assert_eq!(by_stream.state(), 30);
    assert_eq!(by_stream.position(), 2);
    assert_eq!(by_type.state(), 5);
    assert_eq!(global.state(), 35);
    assert_eq!(global.position(), 3);
    assert_eq!(global.status(), ProjectionStatus::Ok);
    assert_eq!(store.subscription_count(), 3);
}

#[tokio::test]
async fn test_publish_runs_in_registration_order() {
    let (store, _repo) = new_store();
    let stream = store.create_stream("Order").await.unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second", "third"] {
        let calls = Arc::clone(&calls);
        store.subscribe(
            Projection::global()
                .on("OrderPlaced", move |n: &u32, _: &Event| {
                    calls.lock().unwrap().push(name);
                    n + 1
                })
                .build(),
        );
    }

    push_all(&store, stream.id, &[1]).await;

    assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_failing_live_projection_is_broken_but_append_commits() {
    // Arrange
    let (store, _repo) = new_store();
    let stream = store.create_stream("Order").await.unwrap();
    let fragile = store.subscribe(
        Projection::for_stream(stream.id)
            .try_on("OrderPlaced", |total: &i64, e: &Event| {
                if add_amount(&0, e) > 50 {
                    Err(format!("amount too large at total {total}"))
                } else {
                    Ok(add_amount(total, e))
                }
            })
            .build(),
    );
    let healthy = store.subscribe(
        Projection::for_stream(stream.id)
            .on("OrderPlaced", add_amount)
            .build(),
    );

    // Act
    push_all(&store, stream.id, &[10, 100, 1]).await;

    // Assert
    assert_eq!(store.get_version_for_stream(stream.id).await.unwrap(), 3);
    assert_eq!(fragile.status(), ProjectionStatus::Broken);
    assert_eq!(fragile.state(), 10);
    let failure = fragile.failure().unwrap();
    assert_eq!(failure.position, 1);
    assert_eq!(failure.message, "amount too large at total 10");
    assert_eq!(healthy.state(), 111);
    assert_eq!(healthy.status(), ProjectionStatus::Ok);
}

#[tokio::test]
async fn test_panicking_live_projection_is_broken_but_append_commits() {
    // Arrange
    let (store, _repo) = new_store();
    let stream = store.create_stream("Order").await.unwrap();
    let fragile = store.subscribe(
        Projection::for_stream(stream.id)
            .on("OrderPlaced", |total: &i64, e: &Event| {
                assert!(add_amount(&0, e) <= 50, "amount too large");
                add_amount(total, e)
            })
            .build(),
    );
    let healthy = store.subscribe(
        Projection::for_stream(stream.id)
            .on("OrderPlaced", add_amount)
            .build(),
    );

    // Act
    let result = store
        .push(stream.id, order_event("OrderPlaced", 100, 1))
        .await;
    store
        .push(stream.id, order_event("OrderPlaced", 5, 2))
        .await
        .unwrap();

    // Assert
    assert!(result.is_ok());
    assert_eq!(store.get_version_for_stream(stream.id).await.unwrap(), 2);
    assert_eq!(fragile.status(), ProjectionStatus::Broken);
    assert_eq!(fragile.state(), 0);
    assert_eq!(
        fragile.failure().unwrap().message,
        "handler panicked: amount too large"
    );
    assert_eq!(healthy.state(), 105);
}

#[tokio::test]
async fn test_replay_all_cold_starts_projections_without_persisting() {
    // Arrange
    let (store, repo) = new_store();
    let a = store.create_stream("Order").await.unwrap();
    let b = store.create_stream("Invoice").await.unwrap();
    push_all(&store, a.id, &[1, 2]).await;
    push_all(&store, b.id, &[3]).await;
    let by_type = store.subscribe(
        Projection::for_stream_type("Order")
            .on("OrderPlaced", add_amount)
            .build(),
    );
    let global = store.subscribe(Projection::global().on("OrderPlaced", add_amount).build());

    // Act
    let report = store.replay_all().await.unwrap();

    // Assert
    assert_eq!(report.events, 3);
    assert!(report.failures.is_empty());
    assert_eq!(by_type.state(), 3);
    assert_eq!(global.state(), 6);
    assert_eq!(repo.event_count().await, 3);
    assert_eq!(store.get_version_for_stream(a.id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_replay_all_reports_failures_and_reset_allows_rebuild() {
    let (store, _repo) = new_store();
    let stream = store.create_stream("Order").await.unwrap();
    push_all(&store, stream.id, &[1, 2]).await;
    let strict = Arc::new(Mutex::new(true));
    let gate = Arc::clone(&strict);
    let live = store.subscribe(
        Projection::global()
            .try_on("OrderPlaced", move |total: &i64, e: &Event| {
                if *gate.lock().unwrap() && add_amount(&0, e) == 2 {
                    Err("rejected")
                } else {
                    Ok(add_amount(total, e))
                }
            })
            .build(),
    );

    let report = store.replay_all().await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].position, 1);
    assert_eq!(live.status(), ProjectionStatus::Broken);

    *strict.lock().unwrap() = false;
    live.reset();
    let report = store.replay_all().await.unwrap();

    assert!(report.failures.is_empty());
    assert_eq!(live.state(), 3);
}
