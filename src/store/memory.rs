//! # In-Memory Envelope Store
//!
//! Process-local [`EnvelopeStore`] backed by a single `parking_lot::Mutex`. Every
//! operation runs under that lock, which gives the same single-document atomicity
//! the claim protocol needs from a real document store. Used for tests and for
//! embedding applications that keep their business state in memory too.

use super::filter::{Filter, Sort, Update};
use super::{collection_name, EnvelopeStore, UnitOfWork};
use crate::error::{OutboxError, Result};
use crate::models::{Envelope, EnvelopeId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

const INDEXED_FIELDS: [&str; 3] = ["status", "created_at", "message_type"];

#[derive(Debug, Default)]
struct Collection {
    documents: BTreeMap<EnvelopeId, Envelope>,
    indexes: Vec<String>,
}

#[derive(Debug)]
struct Inner {
    name: String,
    collection: Mutex<Collection>,
    unavailable: AtomicBool,
}

impl Inner {
    fn check_available(&self, operation: &str) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(OutboxError::store_unavailable(format!(
                "{}: {operation} rejected, store offline",
                self.name
            )));
        }
        Ok(())
    }
}

/// In-memory envelope store
#[derive(Debug, Clone)]
pub struct InMemoryEnvelopeStore {
    inner: Arc<Inner>,
}

impl InMemoryEnvelopeStore {
    /// Create an empty store with the default collection name
    pub fn new() -> Self {
        Self::with_prefix("")
    }

    /// Create an empty store whose collection name carries `prefix`
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: collection_name(prefix),
                collection: Mutex::new(Collection::default()),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Start a unit of work whose inserts become visible only on commit
    pub fn begin(&self) -> MemorySession {
        MemorySession {
            inner: Arc::clone(&self.inner),
            envelopes: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Simulate an outage: while set, every operation fails with
    /// [`OutboxError::StoreUnavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::Release);
    }

    /// Names of the indexes created so far
    pub fn indexes(&self) -> Vec<String> {
        self.inner.collection.lock().indexes.clone()
    }

    /// Number of stored envelopes
    pub fn len(&self) -> usize {
        self.inner.collection.lock().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEnvelopeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EnvelopeStore for InMemoryEnvelopeStore {
    type Session = MemorySession;

    fn collection(&self) -> &str {
        &self.inner.name
    }

    async fn ensure_indexes(&self) -> Result<()> {
        self.inner.check_available("ensure_indexes")?;
        let mut collection = self.inner.collection.lock();
        for field in INDEXED_FIELDS {
            let index = format!("{}_{field}_idx", self.inner.name);
            if collection.indexes.contains(&index) {
                continue;
            }
            debug!(collection = %self.inner.name, index = %index, "Creating index");
            collection.indexes.push(index);
        }
        Ok(())
    }

    async fn insert(
        &self,
        envelope: Envelope,
        session: Option<&mut MemorySession>,
    ) -> Result<EnvelopeId> {
        self.inner.check_available("insert")?;
        let id = envelope.id;
        match session {
            Some(session) => {
                if !Arc::ptr_eq(&session.inner, &self.inner) {
                    return Err(OutboxError::invalid_state(
                        "session belongs to a different store",
                    ));
                }
                session.envelopes.push(envelope);
            }
            None => {
                let mut collection = self.inner.collection.lock();
                if collection.documents.contains_key(&id) {
                    return Err(OutboxError::store("insert", format!("duplicate id {id}")));
                }
                collection.documents.insert(id, envelope);
            }
        }
        Ok(id)
    }

    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        sort: Option<Sort>,
    ) -> Result<Option<Envelope>> {
        self.inner.check_available("find_one_and_update")?;
        let mut collection = self.inner.collection.lock();
        let sort = sort.unwrap_or_else(Sort::fifo);

        let target = collection
            .documents
            .values()
            .filter(|envelope| filter.matches(envelope))
            .min_by(|a, b| sort.compare(a, b))
            .map(|envelope| envelope.id);

        Ok(target.and_then(|id| {
            collection.documents.get_mut(&id).map(|envelope| {
                update.apply(envelope);
                envelope.clone()
            })
        }))
    }

    async fn update_many(&self, filter: &Filter, update: &Update) -> Result<u64> {
        self.inner.check_available("update_many")?;
        let mut collection = self.inner.collection.lock();
        let mut modified = 0;
        for envelope in collection.documents.values_mut() {
            if filter.matches(envelope) {
                update.apply(envelope);
                modified += 1;
            }
        }
        Ok(modified)
    }

    async fn find(
        &self,
        filter: &Filter,
        sort: Option<Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Envelope>> {
        self.inner.check_available("find")?;
        let collection = self.inner.collection.lock();
        let sort = sort.unwrap_or_else(Sort::fifo);

        let mut matched: Vec<Envelope> = collection
            .documents
            .values()
            .filter(|envelope| filter.matches(envelope))
            .cloned()
            .collect();
        matched.sort_by(|a, b| sort.compare(a, b));
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        self.inner.check_available("count")?;
        let collection = self.inner.collection.lock();
        Ok(collection
            .documents
            .values()
            .filter(|envelope| filter.matches(envelope))
            .count() as u64)
    }
}

type EnlistedWrite = Box<dyn FnOnce() + Send>;

/// Unit of work for [`InMemoryEnvelopeStore`]
///
/// Envelope inserts and any enlisted business writes are applied together on
/// [`UnitOfWork::commit`] and dropped on [`UnitOfWork::abort`].
pub struct MemorySession {
    inner: Arc<Inner>,
    envelopes: Vec<Envelope>,
    writes: Vec<EnlistedWrite>,
}

impl MemorySession {
    /// Attach a business write to this unit of work
    pub fn enlist(&mut self, write: impl FnOnce() + Send + 'static) {
        self.writes.push(Box::new(write));
    }

    /// Number of envelopes waiting for commit
    pub fn pending_envelopes(&self) -> usize {
        self.envelopes.len()
    }
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("collection", &self.inner.name)
            .field("envelopes", &self.envelopes.len())
            .field("writes", &self.writes.len())
            .finish()
    }
}

#[async_trait]
impl UnitOfWork for MemorySession {
    async fn commit(self) -> Result<()> {
        self.inner.check_available("commit")?;
        {
            let mut collection = self.inner.collection.lock();
            if let Some(dup) = self
                .envelopes
                .iter()
                .find(|envelope| collection.documents.contains_key(&envelope.id))
            {
                return Err(OutboxError::store(
                    "commit",
                    format!("duplicate id {}", dup.id),
                ));
            }
            for envelope in self.envelopes {
                collection.documents.insert(envelope.id, envelope);
            }
        }
        for write in self.writes {
            write();
        }
        Ok(())
    }

    async fn abort(self) -> Result<()> {
        debug!(
            collection = %self.inner.name,
            discarded = self.envelopes.len(),
            "Unit of work aborted"
        );
        Ok(())
    }
}
