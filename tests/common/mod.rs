#![allow(dead_code)]

use chrono::{DateTime, Utc};
use outbox_dispatcher::config::OutboxConfig;
use outbox_dispatcher::models::{Envelope, EnvelopeId, EnvelopeStatus};
use outbox_dispatcher::registry::{handler_fn, HandlerRegistry};
use outbox_dispatcher::store::{
    EnvelopeStore, Field, Filter, InMemoryEnvelopeStore, Update,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerNotified {
    pub customer_id: u64,
}

/// Configuration for tests that drive cycles by hand
pub fn manual_config() -> OutboxConfig {
    OutboxConfig {
        auto_start: false,
        worker_id: Some("test-worker".to_string()),
        ..OutboxConfig::default()
    }
}

pub fn memory_store() -> Arc<InMemoryEnvelopeStore> {
    Arc::new(InMemoryEnvelopeStore::new())
}

/// Shared log of everything handlers saw, in invocation order
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn record(&self, entry: impl Into<String>) {
        self.seen.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

/// Registry with recording handlers for `OrderPlaced` and `CustomerNotified`
pub fn recording_registry(recorder: &Recorder) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    let orders = recorder.clone();
    registry
        .register_default(handler_fn(move |event: OrderPlaced| {
            let orders = orders.clone();
            async move {
                orders.record(format!("OrderPlaced:{}", event.order_id));
                Ok(())
            }
        }))
        .unwrap();
    let customers = recorder.clone();
    registry
        .register_default(handler_fn(move |event: CustomerNotified| {
            let customers = customers.clone();
            async move {
                customers.record(format!("CustomerNotified:{}", event.customer_id));
                Ok(())
            }
        }))
        .unwrap();
    registry
}

/// Registry whose `OrderPlaced` handler always fails
pub fn failing_registry(recorder: &Recorder) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    let calls = recorder.clone();
    registry
        .register_default(handler_fn(move |event: OrderPlaced| {
            let calls = calls.clone();
            async move {
                calls.record(format!("OrderPlaced:{}", event.order_id));
                anyhow::bail!("downstream rejected order {}", event.order_id)
            }
        }))
        .unwrap();
    registry
}

pub async fn insert_at(
    store: &InMemoryEnvelopeStore,
    message_type: &str,
    payload: &str,
    created_at: DateTime<Utc>,
) -> EnvelopeId {
    store
        .insert(Envelope::new(message_type, payload, created_at), None)
        .await
        .unwrap()
}

pub async fn load(store: &InMemoryEnvelopeStore, id: EnvelopeId) -> Envelope {
    store
        .find(&Filter::eq(Field::Id, id), None, None)
        .await
        .unwrap()
        .into_iter()
        .next()
        .expect("envelope exists")
}

pub async fn count_status(store: &InMemoryEnvelopeStore, status: EnvelopeStatus) -> u64 {
    store
        .count(&Filter::eq(Field::Status, status))
        .await
        .unwrap()
}

/// Make every envelope waiting out a retry delay eligible right away
pub async fn skip_backoff(store: &InMemoryEnvelopeStore) {
    store
        .update_many(
            &Filter::Exists(Field::NextEligibleAt),
            &Update::new().set(Field::NextEligibleAt, Utc::now() - chrono::Duration::seconds(1)),
        )
        .await
        .unwrap();
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
