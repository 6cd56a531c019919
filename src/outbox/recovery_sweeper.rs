//! # Recovery Sweeper
//!
//! Periodic repair of envelopes left behind by crashed or cancelled workers.
//! Runs at the start of every processing cycle, before any claims are made.
//!
//! - **Stale in-flight recovery**: `InFlight` envelopes whose `last_action_at` is
//!   older than the processing TTL go back to `Pending` with their claim cleared.
//! - **Expired claim release**: `Pending` envelopes whose claim lease has passed
//!   get their claim fields cleared.
//!
//! Both are bulk updates over a precise predicate, so sweeping concurrently from
//! several workers is harmless.

use crate::error::Result;
use crate::models::EnvelopeStatus;
use crate::store::{EnvelopeStore, Field, Filter, Update};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// `last_error` recorded on envelopes recovered from a stale in-flight state
pub const STALE_IN_FLIGHT_ERROR: &str =
    "dispatch did not complete within the processing TTL; envelope recovered";

/// What one sweep changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub recovered_in_flight: u64,
    pub released_claims: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.recovered_in_flight == 0 && self.released_claims == 0
    }
}

pub struct RecoverySweeper<S: EnvelopeStore> {
    store: Arc<S>,
    processing_ttl: Duration,
}

impl<S: EnvelopeStore> RecoverySweeper<S> {
    pub fn new(store: Arc<S>, processing_ttl: Duration) -> Self {
        Self {
            store,
            processing_ttl,
        }
    }

    #[instrument(skip(self), fields(collection = %self.store.collection()))]
    pub async fn sweep(&self) -> Result<SweepReport> {
        let report = SweepReport {
            recovered_in_flight: self.recover_stale_in_flight().await?,
            released_claims: self.release_expired_claims().await?,
        };
        if !report.is_empty() {
            info!(
                recovered_in_flight = report.recovered_in_flight,
                released_claims = report.released_claims,
                "🧹 Sweep repaired envelopes"
            );
        }
        Ok(report)
    }

    async fn recover_stale_in_flight(&self) -> Result<u64> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(self.processing_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let filter = Filter::and([
            Filter::eq(Field::Status, EnvelopeStatus::InFlight),
            Filter::lt(Field::LastActionAt, cutoff),
        ]);
        let update = Update::new()
            .set(Field::Status, EnvelopeStatus::Pending)
            .unset(Field::ClaimOwner)
            .unset(Field::ClaimExpiresAt)
            .set(Field::LastError, STALE_IN_FLIGHT_ERROR)
            .set(Field::LastActionAt, now);
        self.store.update_many(&filter, &update).await
    }

    async fn release_expired_claims(&self) -> Result<u64> {
        let filter = Filter::and([
            Filter::eq(Field::Status, EnvelopeStatus::Pending),
            Filter::Exists(Field::ClaimOwner),
            Filter::lt(Field::ClaimExpiresAt, Utc::now()),
        ]);
        let update = Update::new()
            .unset(Field::ClaimOwner)
            .unset(Field::ClaimExpiresAt);
        self.store.update_many(&filter, &update).await
    }
}
