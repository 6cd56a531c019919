//! # Dispatch Engine
//!
//! Drives one claimed envelope through a dispatch attempt:
//!
//! ```text
//! Pending(claimed by worker) ──▶ InFlight ──┬─▶ Processed
//!                                           ├─▶ Pending (next_eligible_at = now + backoff)
//!                                           └─▶ Abandoned (retry budget spent)
//! ```
//!
//! Both transitions are single-document atomic updates guarded on the worker
//! still owning the claim. When a guard does not match the claim was lost (lease
//! expired and another worker took over, or the sweeper recovered the envelope)
//! and the engine backs off without touching the document.
//!
//! The retry budget is `attempts - retry_base`, so an envelope put back by the
//! reprocessing action gets a full budget while `attempts` keeps counting.
//!
//! Missing handlers, undecodable payloads, handler errors, handler timeouts and
//! handler panics are all dispatch failures: they are recorded on the envelope
//! and retried under the same policy. Only store errors are returned.

use crate::config::OutboxConfig;
use crate::error::{DispatchFailure, Result};
use crate::models::{Envelope, EnvelopeId, EnvelopeStatus};
use crate::outbox::claim_coordinator::offset_from;
use crate::registry::HandlerRegistry;
use crate::store::{EnvelopeStore, Field, Filter, Update};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Retry limits and exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OutboxConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            base_delay: config.base_retry_delay(),
            max_delay: config.max_retry_delay(),
        }
    }

    /// Delay before the next attempt after `attempts` failed ones:
    /// `base * 2^(attempts - 1)`, capped at `max_delay`
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OutboxConfig::default())
    }
}

/// Result of one dispatch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Processed {
        id: EnvelopeId,
        attempts: u32,
    },
    Retrying {
        id: EnvelopeId,
        attempts: u32,
        next_eligible_at: DateTime<Utc>,
        error: String,
    },
    Abandoned {
        id: EnvelopeId,
        attempts: u32,
        error: String,
    },
    /// The worker no longer owned the envelope; nothing was written
    ClaimLost { id: EnvelopeId },
}

impl DispatchOutcome {
    pub fn id(&self) -> EnvelopeId {
        match self {
            Self::Processed { id, .. }
            | Self::Retrying { id, .. }
            | Self::Abandoned { id, .. }
            | Self::ClaimLost { id } => *id,
        }
    }
}

/// Runs dispatch attempts against the handler registry
pub struct DispatchEngine<S: EnvelopeStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    handler_timeout: Option<Duration>,
}

impl<S: EnvelopeStore> DispatchEngine<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<HandlerRegistry>,
        policy: RetryPolicy,
        handler_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            handler_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Dispatch an envelope previously claimed by `worker_id`
    #[instrument(skip(self, claimed), fields(envelope_id = %claimed.id, message_type = %claimed.message_type))]
    pub async fn dispatch(&self, claimed: &Envelope, worker_id: &str) -> Result<DispatchOutcome> {
        let Some(envelope) = self.mark_in_flight(claimed.id, worker_id).await? else {
            warn!(worker_id = %worker_id, "Claim lost before dispatch, skipping envelope");
            return Ok(DispatchOutcome::ClaimLost { id: claimed.id });
        };

        let failure = self.invoke(&envelope).await.err();
        let now = Utc::now();
        let attempts = envelope.attempts;
        let spent = envelope.attempts_in_budget();

        let (update, outcome) = match failure {
            None => (
                Update::new().set(Field::Status, EnvelopeStatus::Processed),
                DispatchOutcome::Processed {
                    id: envelope.id,
                    attempts,
                },
            ),
            Some(failure) if self.policy.should_retry(spent) => {
                let next_eligible_at = offset_from(now, self.policy.backoff(spent));
                let error = failure.to_string();
                (
                    Update::new()
                        .set(Field::Status, EnvelopeStatus::Pending)
                        .set(Field::LastError, error.clone())
                        .set(Field::NextEligibleAt, next_eligible_at),
                    DispatchOutcome::Retrying {
                        id: envelope.id,
                        attempts,
                        next_eligible_at,
                        error,
                    },
                )
            }
            Some(failure) => {
                let error = failure.to_string();
                (
                    Update::new()
                        .set(Field::Status, EnvelopeStatus::Abandoned)
                        .set(Field::LastError, error.clone()),
                    DispatchOutcome::Abandoned {
                        id: envelope.id,
                        attempts,
                        error,
                    },
                )
            }
        };

        let update = update
            .set(Field::LastActionAt, now)
            .unset(Field::ClaimOwner)
            .unset(Field::ClaimExpiresAt);
        let update = match outcome {
            DispatchOutcome::Retrying { .. } => update,
            _ => update.unset(Field::NextEligibleAt),
        };

        let filter = Filter::and([
            Filter::eq(Field::Id, envelope.id),
            Filter::eq(Field::Status, EnvelopeStatus::InFlight),
            Filter::eq(Field::ClaimOwner, worker_id),
        ]);
        if self
            .store
            .find_one_and_update(&filter, &update, None)
            .await?
            .is_none()
        {
            warn!(
                worker_id = %worker_id,
                "Envelope was recovered or reclaimed while its handler ran, result discarded"
            );
            return Ok(DispatchOutcome::ClaimLost { id: envelope.id });
        }

        match &outcome {
            DispatchOutcome::Processed { attempts, .. } => {
                info!(attempts, "✅ Envelope processed")
            }
            DispatchOutcome::Retrying {
                attempts,
                next_eligible_at,
                error,
                ..
            } => warn!(attempts, %next_eligible_at, error = %error, "Dispatch failed, will retry"),
            DispatchOutcome::Abandoned { attempts, error, .. } => {
                warn!(attempts, error = %error, "❌ Dispatch failed, retries exhausted, envelope abandoned")
            }
            DispatchOutcome::ClaimLost { .. } => {}
        }
        Ok(outcome)
    }

    /// `Pending` + owned by `worker_id` => `InFlight`, one more attempt
    async fn mark_in_flight(&self, id: EnvelopeId, worker_id: &str) -> Result<Option<Envelope>> {
        let filter = Filter::and([
            Filter::eq(Field::Id, id),
            Filter::eq(Field::Status, EnvelopeStatus::Pending),
            Filter::eq(Field::ClaimOwner, worker_id),
        ]);
        let update = Update::new()
            .set(Field::Status, EnvelopeStatus::InFlight)
            .inc(Field::Attempts, 1)
            .set(Field::LastActionAt, Utc::now());
        self.store.find_one_and_update(&filter, &update, None).await
    }

    async fn invoke(&self, envelope: &Envelope) -> std::result::Result<(), DispatchFailure> {
        let handler = self
            .registry
            .resolve(&envelope.message_type)
            .ok_or(DispatchFailure::NoHandler)?;

        debug!(attempt = envelope.attempts, "Invoking handler");
        let run = AssertUnwindSafe(handler.dispatch(&envelope.payload)).catch_unwind();
        let result = match self.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                DispatchFailure::HandlerTimeout {
                    timeout_ms: millis(limit),
                }
            })?,
            None => run.await,
        };

        result.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(DispatchFailure::Handler {
                message: format!("handler panicked: {message}"),
            })
        })
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
