//! # Message Envelope
//!
//! One stored, serialized outbound message together with its dispatch bookkeeping.
//!
//! ## Status lifecycle
//!
//! ```text
//! Pending ──claim──▶ Pending(claimed) ──dispatch──▶ InFlight ──┬─▶ Processed
//!    ▲                                                         ├─▶ Pending (retry, backoff)
//!    └──────────── sweep (stale in-flight / expired claim) ◀───┴─▶ Abandoned
//! ```
//!
//! `Processed` and `Abandoned` are terminal. Only the administrative reprocessing
//! action moves `Abandoned` or `Failed` back to `Pending`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Store-generated envelope identifier (UUID v7, so ids sort by creation time)
pub type EnvelopeId = Uuid;

/// Dispatch status of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    /// Waiting to be claimed (new, or released for retry)
    Pending,
    /// A worker has started a dispatch attempt
    InFlight,
    /// Handler completed successfully
    Processed,
    /// Marked failed outside the retry cycle, awaiting operator action
    Failed,
    /// Retries exhausted
    Abandoned,
}

impl EnvelopeStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [EnvelopeStatus; 5] = [
        Self::Pending,
        Self::InFlight,
        Self::Processed,
        Self::Failed,
        Self::Abandoned,
    ];

    /// Check if this is a terminal state (no automatic transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Abandoned)
    }

    /// Check if the administrative reprocessing action may reset this status
    pub fn is_reprocessable(&self) -> bool {
        matches!(self, Self::Failed | Self::Abandoned)
    }

    /// Stable string form used by the stores
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl Default for EnvelopeStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnvelopeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(format!("Invalid envelope status: {s}")),
        }
    }
}

/// A stored outbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    /// Key used to resolve a handler
    pub message_type: String,
    /// Serialized message body (JSON)
    pub payload: String,
    pub status: EnvelopeStatus,
    pub created_at: DateTime<Utc>,
    /// Time of the most recent status transition
    pub last_action_at: DateTime<Utc>,
    /// Dispatch attempts ever started; never decreases
    pub attempts: u32,
    /// Value of `attempts` when the envelope was last reprocessed; the retry
    /// budget counts from here
    #[serde(default)]
    pub retry_base: u32,
    pub last_error: Option<String>,
    pub claim_owner: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    /// Earliest time a retried envelope may be claimed again
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Build a fresh pending envelope
    pub fn new(
        message_type: impl Into<String>,
        payload: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            message_type: message_type.into(),
            payload: payload.into(),
            status: EnvelopeStatus::Pending,
            created_at: now,
            last_action_at: now,
            attempts: 0,
            retry_base: 0,
            last_error: None,
            claim_owner: None,
            claim_expires_at: None,
            next_eligible_at: None,
        }
    }

    /// Whether `worker_id` holds a claim that has not yet expired at `now`
    pub fn is_claimed_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.claim_owner.as_deref() == Some(worker_id)
            && self.claim_expires_at.is_some_and(|expires| expires > now)
    }

    /// Attempts made since creation or the last reprocessing
    pub fn attempts_in_budget(&self) -> u32 {
        self.attempts.saturating_sub(self.retry_base)
    }

    /// Check the data-model invariants that must hold for every stored envelope
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.claim_owner.is_some() != self.claim_expires_at.is_some() {
            return Err(format!(
                "envelope {}: claim_owner and claim_expires_at must be set together",
                self.id
            ));
        }
        if self.retry_base > self.attempts {
            return Err(format!(
                "envelope {}: retry_base {} is ahead of attempts {}",
                self.id, self.retry_base, self.attempts
            ));
        }
        if self.status == EnvelopeStatus::Processed && self.claim_owner.is_some() {
            return Err(format!(
                "envelope {}: processed envelope still holds a claim",
                self.id
            ));
        }
        Ok(())
    }
}
