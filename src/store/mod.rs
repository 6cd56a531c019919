//! # Envelope Store
//!
//! The document-store boundary the outbox is written against.
//!
//! ## Key Features
//!
//! - **Atomic find-and-update**: select one document by filter and sort, mutate it
//!   and return the post-update document in a single atomic step. This is the only
//!   concurrency-safety mechanism the claim coordinator relies on.
//! - **Bulk update by predicate**: used by the sweeper, always with a precise filter
//! - **Idempotent index creation** on `status`, `created_at` and `message_type`
//! - **Explicit sessions**: inserts take an optional session so they can commit
//!   together with the caller's business writes
//!
//! ## Backends
//!
//! - [`InMemoryEnvelopeStore`] - process-local store, atomic under one lock
//! - [`PgEnvelopeStore`] - PostgreSQL via sqlx, claims use `FOR UPDATE SKIP LOCKED`

pub mod filter;
pub mod memory;
pub mod postgres;

pub use filter::{Field, Filter, Op, Sort, Update, UpdateOp, Value};
pub use memory::{InMemoryEnvelopeStore, MemorySession};
pub use postgres::{PgEnvelopeStore, PgSession};

use crate::error::Result;
use crate::models::{Envelope, EnvelopeId};
use async_trait::async_trait;

/// Base collection name; the configured prefix is prepended to it
pub const BASE_COLLECTION_NAME: &str = "outbox_messages";

/// Build the collection (table) name for a prefix
pub fn collection_name(prefix: &str) -> String {
    format!("{prefix}{BASE_COLLECTION_NAME}")
}

/// Transaction handle owned by the caller
///
/// The outbox only ever writes through a session; deciding its fate is the
/// caller's job.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Make every enlisted write durable
    async fn commit(self) -> Result<()>;

    /// Discard every enlisted write
    async fn abort(self) -> Result<()>;
}

/// Persistence operations required by the outbox
#[async_trait]
pub trait EnvelopeStore: Send + Sync + 'static {
    /// Ambient transaction type accepted by [`EnvelopeStore::insert`]
    type Session: UnitOfWork;

    /// Logical collection name, including any configured prefix
    fn collection(&self) -> &str;

    /// Create the collection and its secondary indexes; safe to call repeatedly
    async fn ensure_indexes(&self) -> Result<()>;

    /// Persist a new envelope, through `session` when one is supplied
    async fn insert(
        &self,
        envelope: Envelope,
        session: Option<&mut Self::Session>,
    ) -> Result<EnvelopeId>;

    /// Atomically update the first document matching `filter` under `sort` and
    /// return it as it is after the update
    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        sort: Option<Sort>,
    ) -> Result<Option<Envelope>>;

    /// Apply `update` to every document matching `filter`; returns the count
    async fn update_many(&self, filter: &Filter, update: &Update) -> Result<u64>;

    /// Read documents matching `filter`
    async fn find(
        &self,
        filter: &Filter,
        sort: Option<Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Envelope>>;

    /// Count documents matching `filter`
    async fn count(&self, filter: &Filter) -> Result<u64>;
}
