//! Background loop behaviour: polling, store outages, cancellation and shutdown.

mod common;

use chrono::Utc;
use common::*;
use outbox_dispatcher::config::OutboxConfig;
use outbox_dispatcher::models::EnvelopeStatus;
use outbox_dispatcher::outbox::{
    ClaimCoordinator, DispatchEngine, Outbox, OutboxProcessor, ProcessorConfig, RecoverySweeper,
    RetryPolicy, ShutdownOutcome,
};
use outbox_dispatcher::registry::{handler_fn, HandlerRegistry};
use outbox_dispatcher::store::{EnvelopeStore, Field, Filter, Update};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn fast_config() -> OutboxConfig {
    OutboxConfig {
        poll_interval_seconds: 1,
        auto_start: true,
        worker_id: Some("loop-worker".to_string()),
        ..OutboxConfig::default()
    }
}

#[tokio::test]
async fn test_auto_started_loop_delivers_appended_messages() {
    let store = memory_store();
    let recorder = Recorder::default();
    let outbox = Outbox::builder(Arc::clone(&store), fast_config())
        .with_registry(recording_registry(&recorder))
        .build()
        .await
        .unwrap();
    assert!(outbox.is_running());

    outbox.append(&OrderPlaced { order_id: 1 }, None).await.unwrap();
    outbox.append(&OrderPlaced { order_id: 2 }, None).await.unwrap();

    let delivered = wait_until(Duration::from_secs(5), || {
        let store = Arc::clone(&store);
        async move { count_status(&store, EnvelopeStatus::Processed).await == 2 }
    })
    .await;
    assert!(delivered);

    assert_eq!(
        outbox.shutdown().await.unwrap(),
        Some(ShutdownOutcome::Graceful)
    );
    assert_eq!(recorder.len(), 2);
}

#[tokio::test]
async fn test_loop_survives_store_outage() {
    let store = memory_store();
    let recorder = Recorder::default();
    let outbox = Outbox::builder(Arc::clone(&store), fast_config())
        .with_registry(recording_registry(&recorder))
        .build()
        .await
        .unwrap();

    store.set_unavailable(true);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(outbox.is_running());

    store.set_unavailable(false);
    outbox.append(&OrderPlaced { order_id: 3 }, None).await.unwrap();
    let delivered = wait_until(Duration::from_secs(5), || {
        let store = Arc::clone(&store);
        async move { count_status(&store, EnvelopeStatus::Processed).await == 1 }
    })
    .await;
    assert!(delivered);
    outbox.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_lets_started_dispatch_finish() {
    let store = memory_store();
    let started = Arc::new(Notify::new());
    let finished = Arc::new(AtomicBool::new(false));

    let mut registry = HandlerRegistry::new();
    let (on_start, on_finish) = (Arc::clone(&started), Arc::clone(&finished));
    registry
        .register_default(handler_fn(move |_: OrderPlaced| {
            let (on_start, on_finish) = (Arc::clone(&on_start), Arc::clone(&on_finish));
            async move {
                on_start.notify_one();
                tokio::time::sleep(Duration::from_millis(300)).await;
                on_finish.store(true, Ordering::SeqCst);
                Ok(())
            }
        }))
        .unwrap();

    let outbox = Outbox::builder(Arc::clone(&store), manual_config())
        .with_registry(registry)
        .build()
        .await
        .unwrap();
    let id = outbox.append(&OrderPlaced { order_id: 1 }, None).await.unwrap();
    outbox.start().unwrap();

    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .unwrap();
    assert_eq!(
        outbox.shutdown().await.unwrap(),
        Some(ShutdownOutcome::Graceful)
    );
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(
        outbox.find_by_id(id).await.unwrap().status,
        EnvelopeStatus::Processed
    );
}

#[tokio::test]
async fn test_expired_grace_period_aborts_and_sweeper_recovers() {
    let store = memory_store();
    let started = Arc::new(Notify::new());

    let mut registry = HandlerRegistry::new();
    let on_start = Arc::clone(&started);
    registry
        .register_default(handler_fn(move |_: OrderPlaced| {
            let on_start = Arc::clone(&on_start);
            async move {
                on_start.notify_one();
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
        }))
        .unwrap();

    let config = OutboxConfig {
        shutdown_grace_period_seconds: 1,
        ..manual_config()
    };
    let outbox = Outbox::builder(Arc::clone(&store), config)
        .with_registry(registry)
        .build()
        .await
        .unwrap();
    let id = outbox.append(&OrderPlaced { order_id: 1 }, None).await.unwrap();
    outbox.start().unwrap();

    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .unwrap();
    assert_eq!(
        outbox.shutdown().await.unwrap(),
        Some(ShutdownOutcome::Aborted)
    );

    let stuck = outbox.find_by_id(id).await.unwrap();
    assert_eq!(stuck.status, EnvelopeStatus::InFlight);
    assert_eq!(stuck.attempts, 1);

    // pretend the processing TTL has passed
    store
        .update_many(
            &Filter::eq(Field::Id, id),
            &Update::new().set(Field::LastActionAt, Utc::now() - chrono::Duration::hours(1)),
        )
        .await
        .unwrap();
    let sweeper = RecoverySweeper::new(Arc::clone(&store), outbox.config().processing_ttl());
    assert_eq!(sweeper.sweep().await.unwrap().recovered_in_flight, 1);
    assert_eq!(
        outbox.find_by_id(id).await.unwrap().status,
        EnvelopeStatus::Pending
    );
}

#[tokio::test]
async fn test_cancellation_mid_cycle_stops_before_next_claim() {
    let store = memory_store();
    let cancel = CancellationToken::new();

    let mut registry = HandlerRegistry::new();
    let token = cancel.clone();
    registry
        .register_default(handler_fn(move |_: OrderPlaced| {
            let token = token.clone();
            async move {
                token.cancel();
                Ok(())
            }
        }))
        .unwrap();

    let base = Utc::now() - chrono::Duration::minutes(1);
    for i in 0..3 {
        insert_at(
            &store,
            "OrderPlaced",
            r#"{"order_id":1}"#,
            base + chrono::Duration::seconds(i),
        )
        .await;
    }

    let processor = OutboxProcessor::new(
        RecoverySweeper::new(Arc::clone(&store), Duration::from_secs(300)),
        ClaimCoordinator::new(Arc::clone(&store)),
        DispatchEngine::new(
            Arc::clone(&store),
            Arc::new(registry),
            RetryPolicy::default(),
            None,
        ),
        ProcessorConfig {
            worker_id: "w".to_string(),
            batch_size: 10,
            claim_lease: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            inter_cycle_delay: Duration::ZERO,
        },
    );

    let report = processor.run_cycle(&cancel).await;
    assert!(report.cancelled);
    assert_eq!(report.claimed, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(count_status(&store, EnvelopeStatus::Pending).await, 2);
    assert_eq!(
        store
            .count(&Filter::Exists(Field::ClaimOwner))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_peer_workers_share_one_store() {
    let store = memory_store();
    let recorder = Recorder::default();

    let mut outboxes = Vec::new();
    for worker in ["peer-a", "peer-b", "peer-c"] {
        let config = OutboxConfig {
            worker_id: Some(worker.to_string()),
            batch_size: 2,
            ..fast_config()
        };
        outboxes.push(
            Outbox::builder(Arc::clone(&store), config)
                .with_registry(recording_registry(&recorder))
                .build()
                .await
                .unwrap(),
        );
    }

    for order_id in 0..12 {
        outboxes[0]
            .append(&OrderPlaced { order_id }, None)
            .await
            .unwrap();
    }

    let delivered = wait_until(Duration::from_secs(10), || {
        let store = Arc::clone(&store);
        async move { count_status(&store, EnvelopeStatus::Processed).await == 12 }
    })
    .await;
    assert!(delivered);

    for outbox in &outboxes {
        outbox.shutdown().await.unwrap();
    }
    let mut seen = recorder.entries();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 12);
}
