//! # Outbox Writer
//!
//! Turns a domain message into a pending envelope and persists it, optionally
//! inside the caller's unit of work so the envelope commits or rolls back
//! together with the business change that produced it.
//!
//! The writer never commits or aborts a session it is handed.

use crate::error::{OutboxError, Result};
use crate::models::{Envelope, EnvelopeId};
use crate::registry::message_type_of;
use crate::store::EnvelopeStore;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// Appends messages to the outbox
#[derive(Debug)]
pub struct OutboxWriter<S: EnvelopeStore> {
    store: Arc<S>,
}

impl<S: EnvelopeStore> Clone for OutboxWriter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: EnvelopeStore> OutboxWriter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Append `message` tagged with its own type name
    pub async fn append<M>(
        &self,
        message: &M,
        session: Option<&mut S::Session>,
    ) -> Result<EnvelopeId>
    where
        M: Serialize + Sync + ?Sized,
    {
        self.append_as(&message_type_of::<M>(), message, session)
            .await
    }

    /// Append `message` under an explicit `message_type` tag
    #[instrument(skip(self, message, session), fields(collection = %self.store.collection(), in_session = session.is_some()))]
    pub async fn append_as<M>(
        &self,
        message_type: &str,
        message: &M,
        session: Option<&mut S::Session>,
    ) -> Result<EnvelopeId>
    where
        M: Serialize + Sync + ?Sized,
    {
        if message_type.trim().is_empty() {
            return Err(OutboxError::invalid_state("message_type must not be empty"));
        }
        let payload = serde_json::to_string(message)
            .map_err(|e| OutboxError::serialization(format!("{message_type}: {e}")))?;
        let envelope = Envelope::new(message_type, payload, Utc::now());

        let id = self.store.insert(envelope, session).await.map_err(|e| {
            error!(message_type = %message_type, error = %e, "Failed to append outbox message");
            e
        })?;

        debug!(envelope_id = %id, message_type = %message_type, "Appended outbox message");
        Ok(id)
    }
}
