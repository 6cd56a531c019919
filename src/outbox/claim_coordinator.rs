//! # Claim Coordinator
//!
//! Hands out exclusive, time-limited claims on pending envelopes.
//!
//! ## Key Features
//!
//! - **Atomic claiming**: selection and claim happen in one find-and-update, so
//!   two workers can never hold a live claim on the same envelope
//! - **Lease expiry**: a claim left behind by a crashed worker becomes claimable
//!   again once `claim_expires_at` has passed
//! - **Backoff aware**: envelopes waiting out a retry delay (`next_eligible_at`
//!   in the future) are skipped
//! - **FIFO**: oldest `created_at` first, ties broken by id
//!
//! Claims issued by one coordinator are serialized in-process. That only saves
//! pointless store contention between tasks of the same worker; the store
//! operation is what makes claiming safe across workers.

use crate::error::Result;
use crate::models::{Envelope, EnvelopeId, EnvelopeStatus};
use crate::store::{EnvelopeStore, Field, Filter, Sort, Update};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument};

/// Claim coordinator for one worker process
pub struct ClaimCoordinator<S: EnvelopeStore> {
    store: Arc<S>,
    claim_lock: Mutex<()>,
}

impl<S: EnvelopeStore> ClaimCoordinator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            claim_lock: Mutex::new(()),
        }
    }

    /// Claim the oldest eligible pending envelope for `worker_id`
    ///
    /// Returns `Ok(None)` when nothing is eligible.
    #[instrument(skip(self), fields(collection = %self.store.collection()))]
    pub async fn claim_next(&self, worker_id: &str, lease: Duration) -> Result<Option<Envelope>> {
        let _guard = self.claim_lock.lock().await;
        let now = Utc::now();
        let expires_at = offset_from(now, lease);

        let update = Update::new()
            .set(Field::ClaimOwner, worker_id)
            .set(Field::ClaimExpiresAt, expires_at);

        let claimed = self
            .store
            .find_one_and_update(&claimable_filter(now), &update, Some(Sort::fifo()))
            .await
            .map_err(|e| {
                error!(worker_id = %worker_id, error = %e, "Failed to claim envelope");
                e
            })?;

        match &claimed {
            Some(envelope) => debug!(
                envelope_id = %envelope.id,
                message_type = %envelope.message_type,
                claim_expires_at = %expires_at,
                "Claimed envelope"
            ),
            None => debug!("No eligible envelopes to claim"),
        }
        Ok(claimed)
    }

    /// Give back a claim that `worker_id` still holds on a pending envelope
    ///
    /// Returns whether a claim was released. Used when shutdown is observed
    /// between claiming and dispatching.
    #[instrument(skip(self), fields(collection = %self.store.collection()))]
    pub async fn release_claim(&self, id: EnvelopeId, worker_id: &str) -> Result<bool> {
        let filter = Filter::and([
            Filter::eq(Field::Id, id),
            Filter::eq(Field::Status, EnvelopeStatus::Pending),
            Filter::eq(Field::ClaimOwner, worker_id),
        ]);
        let update = Update::new()
            .unset(Field::ClaimOwner)
            .unset(Field::ClaimExpiresAt);

        let released = self
            .store
            .find_one_and_update(&filter, &update, None)
            .await?
            .is_some();
        debug!(envelope_id = %id, released, "Released claim");
        Ok(released)
    }
}

/// Pending, not held by a live claim, and past any retry delay
pub fn claimable_filter(now: DateTime<Utc>) -> Filter {
    Filter::and([
        Filter::eq(Field::Status, EnvelopeStatus::Pending),
        Filter::or([
            Filter::Missing(Field::ClaimOwner),
            Filter::lt(Field::ClaimExpiresAt, now),
        ]),
        Filter::or([
            Filter::Missing(Field::NextEligibleAt),
            Filter::lte(Field::NextEligibleAt, now),
        ]),
    ])
}

/// `now + duration`, saturating at the largest representable time
pub(crate) fn offset_from(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEnvelopeStore;

    const LEASE: Duration = Duration::from_secs(120);

    async fn seeded(count: usize) -> (Arc<InMemoryEnvelopeStore>, Vec<EnvelopeId>) {
        let store = Arc::new(InMemoryEnvelopeStore::new());
        let base = Utc::now() - chrono::Duration::minutes(10);
        let mut ids = Vec::new();
        for i in 0..count {
            let envelope = Envelope::new("A", "{}", base + chrono::Duration::seconds(i as i64));
            ids.push(store.insert(envelope, None).await.unwrap());
        }
        (store, ids)
    }

    #[tokio::test]
    async fn test_claims_oldest_first_and_sets_lease() {
        let (store, ids) = seeded(3).await;
        let coordinator = ClaimCoordinator::new(store);

        for expected in &ids {
            let claimed = coordinator
                .claim_next("worker-a", LEASE)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(claimed.id, *expected);
            assert_eq!(claimed.claim_owner.as_deref(), Some("worker-a"));
            assert!(claimed.claim_expires_at.unwrap() > Utc::now());
            assert_eq!(claimed.status, EnvelopeStatus::Pending);
        }
        assert!(coordinator
            .claim_next("worker-a", LEASE)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_live_claim_blocks_other_workers() {
        let (store, _) = seeded(1).await;
        let coordinator = ClaimCoordinator::new(store);

        assert!(coordinator.claim_next("a", LEASE).await.unwrap().is_some());
        assert!(coordinator.claim_next("b", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_envelopes_in_backoff_are_skipped() {
        let (store, ids) = seeded(1).await;
        store
            .update_many(
                &Filter::eq(Field::Id, ids[0]),
                &Update::new().set(Field::NextEligibleAt, Utc::now() + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        let coordinator = ClaimCoordinator::new(Arc::clone(&store));
        assert!(coordinator.claim_next("a", LEASE).await.unwrap().is_none());

        store
            .update_many(
                &Filter::eq(Field::Id, ids[0]),
                &Update::new().set(Field::NextEligibleAt, Utc::now() - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();
        assert!(coordinator.claim_next("a", LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_claim_only_for_owner() {
        let (store, ids) = seeded(1).await;
        let coordinator = ClaimCoordinator::new(store);
        coordinator.claim_next("a", LEASE).await.unwrap().unwrap();

        assert!(!coordinator.release_claim(ids[0], "b").await.unwrap());
        assert!(coordinator.release_claim(ids[0], "a").await.unwrap());

        let reclaimed = coordinator.claim_next("b", LEASE).await.unwrap().unwrap();
        assert_eq!(reclaimed.claim_owner.as_deref(), Some("b"));
    }

    #[test]
    fn test_huge_lease_saturates() {
        let now = Utc::now();
        assert_eq!(offset_from(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            offset_from(now, Duration::from_secs(90)),
            now + chrono::Duration::seconds(90)
        );
    }
}
