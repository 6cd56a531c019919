#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Outbox Dispatcher
//!
//! Transactional outbox for Rust services: messages are written to an outbox
//! collection in the same unit of work as the business change that produced
//! them, then delivered to in-process handlers by a background loop with
//! at-least-once semantics.
//!
//! ## Key Features
//!
//! - **Atomic append**: envelopes commit or roll back with the caller's session
//! - **Claim-based concurrency**: any number of workers share one store; a single
//!   atomic find-and-update is the only coordination, no leader election
//! - **Retry with backoff**: failed dispatches are retried with exponential
//!   backoff enforced through `next_eligible_at`, then abandoned
//! - **Stuck-message recovery**: envelopes left in flight by crashed workers and
//!   expired claims are repaired by a sweeper every cycle
//! - **Graceful shutdown**: cooperative cancellation with a grace period
//!
//! ## Module Organization
//!
//! - [`outbox`] - Writer, claim coordinator, dispatch engine, sweeper, processing loop
//! - [`store`] - Envelope store trait, filter vocabulary, in-memory and PostgreSQL backends
//! - [`registry`] - Message type to handler mapping with typed decoding
//! - [`models`] - Envelope and status lifecycle
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging initialization
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use outbox_dispatcher::config::OutboxConfig;
//! use outbox_dispatcher::outbox::Outbox;
//! use outbox_dispatcher::registry::handler_fn;
//! use outbox_dispatcher::store::PgEnvelopeStore;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct InvoicePaid {
//!     invoice_id: i64,
//! }
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! outbox_dispatcher::logging::init_structured_logging();
//! let config = OutboxConfig::from_env()?;
//! let store = Arc::new(PgEnvelopeStore::new(pool, &config.collection_name_prefix)?);
//!
//! let outbox = Outbox::builder(Arc::clone(&store), config)
//!     .register(
//!         "InvoicePaid",
//!         handler_fn(|event: InvoicePaid| async move {
//!             tracing::info!(invoice_id = event.invoice_id, "sending receipt");
//!             Ok(())
//!         }),
//!     )?
//!     .build()
//!     .await?;
//!
//! let mut session = store.begin().await?;
//! sqlx::query("UPDATE invoices SET paid = true WHERE id = 42")
//!     .execute(session.connection())
//!     .await?;
//! outbox.append(&InvoicePaid { invoice_id: 42 }, Some(&mut session)).await?;
//! outbox_dispatcher::store::UnitOfWork::commit(session).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery Guarantees
//!
//! Delivery is at-least-once. A claim lease is not a kill signal, so a slow
//! handler may still be running when another worker picks the same envelope
//! up again. Handlers must be idempotent.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod outbox;
pub mod registry;
pub mod store;

pub use config::OutboxConfig;
pub use error::{DispatchFailure, OutboxError, Result};
pub use models::{Envelope, EnvelopeId, EnvelopeStatus};
pub use outbox::{Outbox, OutboxBuilder};
