//! # Transactional Outbox
//!
//! Reliable, at-least-once delivery of messages produced inside business
//! transactions.
//!
//! ## Architecture
//!
//! ```text
//! append ──▶ [envelope store] ◀── sweep ── RecoverySweeper
//!                   ▲   ▲
//!          claim ───┘   └─── mark in flight / final state
//!      ClaimCoordinator        DispatchEngine ──▶ HandlerRegistry ──▶ handler
//!                 ╲              ╱
//!                  OutboxProcessor (one polling loop per worker)
//! ```
//!
//! Any number of workers can share one store. The only cross-worker
//! coordination is the atomic claim; there is no leader.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use outbox_dispatcher::config::OutboxConfig;
//! use outbox_dispatcher::outbox::OutboxBuilder;
//! use outbox_dispatcher::registry::handler_fn;
//! use outbox_dispatcher::store::{InMemoryEnvelopeStore, UnitOfWork};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: u64,
//! }
//!
//! # async fn example() -> outbox_dispatcher::Result<()> {
//! let store = Arc::new(InMemoryEnvelopeStore::new());
//! let outbox = OutboxBuilder::new(Arc::clone(&store), OutboxConfig::default())
//!     .register(
//!         "OrderPlaced",
//!         handler_fn(|event: OrderPlaced| async move {
//!             println!("shipping {}", event.order_id);
//!             Ok(())
//!         }),
//!     )?
//!     .build()
//!     .await?;
//!
//! let mut session = store.begin();
//! outbox.append(&OrderPlaced { order_id: 7 }, Some(&mut session)).await?;
//! session.commit().await?;
//!
//! outbox.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod claim_coordinator;
pub mod dispatch_engine;
pub mod processor;
pub mod recovery_sweeper;
pub mod writer;

pub use claim_coordinator::{claimable_filter, ClaimCoordinator};
pub use dispatch_engine::{DispatchEngine, DispatchOutcome, RetryPolicy};
pub use processor::{CycleReport, OutboxProcessor, ProcessorConfig, ProcessorHandle, ShutdownOutcome};
pub use recovery_sweeper::{RecoverySweeper, SweepReport, STALE_IN_FLIGHT_ERROR};
pub use writer::OutboxWriter;

use crate::config::OutboxConfig;
use crate::error::{OutboxError, Result};
use crate::models::{Envelope, EnvelopeId, EnvelopeStatus};
use crate::registry::{HandlerRegistry, MessageHandler};
use crate::store::{collection_name, EnvelopeStore, Field, Filter, Sort, Update, Value};
use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Builds an [`Outbox`]: configuration, store and handler registrations
pub struct OutboxBuilder<S: EnvelopeStore> {
    store: Arc<S>,
    config: OutboxConfig,
    registry: HandlerRegistry,
}

impl<S: EnvelopeStore> OutboxBuilder<S> {
    pub fn new(store: Arc<S>, config: OutboxConfig) -> Self {
        Self {
            store,
            config,
            registry: HandlerRegistry::new(),
        }
    }

    /// Register a JSON-decoded handler for `message_type`
    pub fn register<M, H>(mut self, message_type: impl Into<String>, handler: H) -> Result<Self>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>,
    {
        self.registry.register(message_type, handler)?;
        Ok(self)
    }

    /// Use a registry assembled elsewhere; replaces earlier registrations
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    /// Validate configuration, bootstrap indexes and start the loop when
    /// `auto_start` is set
    #[instrument(skip(self), fields(collection = %self.store.collection()))]
    pub async fn build(self) -> Result<Outbox<S>> {
        self.config.validate()?;
        let expected = collection_name(&self.config.collection_name_prefix);
        if self.store.collection() != expected {
            return Err(OutboxError::configuration(
                "collection_name_prefix",
                format!(
                    "store collection '{}' does not match configured '{expected}'",
                    self.store.collection()
                ),
            ));
        }

        self.store.ensure_indexes().await?;

        let worker_id = self.config.resolve_worker_id();
        let stats = self.registry.stats();
        let registry = Arc::new(self.registry);
        let processor = OutboxProcessor::new(
            RecoverySweeper::new(Arc::clone(&self.store), self.config.processing_ttl()),
            ClaimCoordinator::new(Arc::clone(&self.store)),
            DispatchEngine::new(
                Arc::clone(&self.store),
                registry,
                RetryPolicy::from_config(&self.config),
                self.config.handler_timeout(),
            ),
            ProcessorConfig {
                worker_id: worker_id.clone(),
                batch_size: self.config.batch_size,
                claim_lease: self.config.claim_lease(),
                poll_interval: self.config.poll_interval(),
                inter_cycle_delay: self.config.inter_cycle_delay(),
            },
        );

        let outbox = Outbox {
            writer: OutboxWriter::new(Arc::clone(&self.store)),
            store: self.store,
            processor: Arc::new(processor),
            config: self.config,
            handle: Mutex::new(None),
        };

        info!(
            worker_id = %worker_id,
            handlers = stats.total_handlers,
            message_types = ?stats.message_types,
            auto_start = outbox.config.auto_start,
            "Outbox ready"
        );

        if outbox.config.auto_start {
            outbox.start()?;
        }
        Ok(outbox)
    }
}

/// The outbox as seen by the embedding application
pub struct Outbox<S: EnvelopeStore> {
    store: Arc<S>,
    writer: OutboxWriter<S>,
    processor: Arc<OutboxProcessor<S>>,
    config: OutboxConfig,
    handle: Mutex<Option<ProcessorHandle>>,
}

impl<S: EnvelopeStore> Outbox<S> {
    pub fn builder(store: Arc<S>, config: OutboxConfig) -> OutboxBuilder<S> {
        OutboxBuilder::new(store, config)
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        self.processor.worker_id()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Cloneable writer for code paths that only append
    pub fn writer(&self) -> OutboxWriter<S> {
        self.writer.clone()
    }

    /// Append `message` tagged with its own type name
    pub async fn append<M>(&self, message: &M, session: Option<&mut S::Session>) -> Result<EnvelopeId>
    where
        M: Serialize + Sync + ?Sized,
    {
        self.writer.append(message, session).await
    }

    /// Append `message` under an explicit `message_type` tag
    pub async fn append_as<M>(
        &self,
        message_type: &str,
        message: &M,
        session: Option<&mut S::Session>,
    ) -> Result<EnvelopeId>
    where
        M: Serialize + Sync + ?Sized,
    {
        self.writer.append_as(message_type, message, session).await
    }

    /// Envelopes in `status`, oldest first
    pub async fn find_by_status(
        &self,
        status: EnvelopeStatus,
        limit: Option<usize>,
    ) -> Result<Vec<Envelope>> {
        self.store
            .find(&Filter::eq(Field::Status, status), Some(Sort::fifo()), limit)
            .await
    }

    pub async fn find_by_id(&self, id: EnvelopeId) -> Result<Envelope> {
        self.store
            .find(&Filter::eq(Field::Id, id), None, Some(1))
            .await?
            .into_iter()
            .next()
            .ok_or(OutboxError::NotFound { id })
    }

    /// Number of envelopes per status; every status is present
    pub async fn status_counts(&self) -> Result<BTreeMap<EnvelopeStatus, u64>> {
        let mut counts = BTreeMap::new();
        for status in EnvelopeStatus::ALL {
            let count = self.store.count(&Filter::eq(Field::Status, status)).await?;
            counts.insert(status, count);
        }
        Ok(counts)
    }

    /// Operator action: put a `Failed` or `Abandoned` envelope back to `Pending`
    /// with a fresh retry budget
    ///
    /// `attempts` is kept; `retry_base` moves up to it so the budget restarts.
    #[instrument(skip(self))]
    pub async fn reprocess(&self, id: EnvelopeId) -> Result<Envelope> {
        let current = self.find_by_id(id).await?;
        if !current.status.is_reprocessable() {
            return Err(OutboxError::invalid_state(format!(
                "envelope {id} is {}, only failed or abandoned envelopes can be reprocessed",
                current.status
            )));
        }

        let filter = Filter::and([
            Filter::eq(Field::Id, id),
            Filter::eq(Field::Status, current.status),
            Filter::eq(Field::Attempts, Value::Int(i64::from(current.attempts))),
        ]);
        let update = Update::new()
            .set(Field::Status, EnvelopeStatus::Pending)
            .set(Field::RetryBase, Value::Int(i64::from(current.attempts)))
            .set(Field::LastActionAt, Utc::now())
            .unset(Field::ClaimOwner)
            .unset(Field::ClaimExpiresAt)
            .unset(Field::NextEligibleAt);

        match self.store.find_one_and_update(&filter, &update, None).await? {
            Some(envelope) => {
                info!(
                    envelope_id = %id,
                    attempts = envelope.attempts,
                    "♻️ Envelope reset to pending for reprocessing"
                );
                Ok(envelope)
            }
            None => Err(OutboxError::invalid_state(format!(
                "envelope {id} changed while being reprocessed"
            ))),
        }
    }

    /// Run one processing cycle on the caller's task
    pub async fn run_cycle(&self) -> CycleReport {
        self.processor.run_cycle(&CancellationToken::new()).await
    }

    /// Start the processing loop
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(OutboxError::invalid_state(
                "outbox processor is already running",
            ));
        }
        *handle = Some(Arc::clone(&self.processor).spawn());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop, waiting up to the configured grace period
    ///
    /// Returns `None` when the loop was not running.
    pub async fn shutdown(&self) -> Result<Option<ShutdownOutcome>> {
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => handle
                .shutdown(self.config.shutdown_grace_period())
                .await
                .map(Some),
            None => Ok(None),
        }
    }
}

impl<S: EnvelopeStore> Drop for Outbox<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().as_ref() {
            if !handle.is_finished() {
                warn!(worker_id = %handle.worker_id(), "Outbox dropped while running, cancelling processor");
                handle.cancel();
            }
        }
    }
}
