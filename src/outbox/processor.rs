//! # Outbox Processor
//!
//! The long-lived polling loop of one worker.
//!
//! ## Cycle
//!
//! ```text
//! tick ──▶ sweep ──▶ claim ─▶ dispatch ─▶ claim ─▶ dispatch ... (≤ batch_size)
//!                      │
//!                      └── nothing eligible: cycle ends early
//! ```
//!
//! Dispatch inside a cycle is sequential. Cancellation is cooperative: the token
//! is checked before the sweep, before each claim and before each dispatch. A
//! dispatch that has already started is allowed to finish; if shutdown's grace
//! period runs out first the task is aborted and the envelope it was working on
//! stays `InFlight` until a later sweep recovers it.
//!
//! Store failures never kill the loop. The cycle logs the error, ends early and
//! the next tick tries again.

use super::claim_coordinator::ClaimCoordinator;
use super::dispatch_engine::{millis, DispatchEngine, DispatchOutcome};
use super::recovery_sweeper::{RecoverySweeper, SweepReport};
use crate::error::{OutboxError, Result};
use crate::store::EnvelopeStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Processing loop settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    pub worker_id: String,
    pub batch_size: usize,
    pub claim_lease: Duration,
    pub poll_interval: Duration,
    pub inter_cycle_delay: Duration,
}

/// What one processing cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub sweep: SweepReport,
    pub claimed: usize,
    pub processed: usize,
    pub retried: usize,
    pub abandoned: usize,
    pub claims_lost: usize,
    /// Claims handed back because cancellation arrived before dispatch
    pub released: usize,
    pub cancelled: bool,
    /// Store error that ended the cycle early
    pub error: Option<String>,
}

impl CycleReport {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Processed { .. } => self.processed += 1,
            DispatchOutcome::Retrying { .. } => self.retried += 1,
            DispatchOutcome::Abandoned { .. } => self.abandoned += 1,
            DispatchOutcome::ClaimLost { .. } => self.claims_lost += 1,
        }
    }

    fn fail(&mut self, stage: &str, err: &OutboxError) {
        if err.is_unavailable() {
            warn!(stage, error = %err, "Store unavailable, ending cycle early");
        } else {
            error!(stage, error = %err, "Store error, ending cycle early");
        }
        self.error = Some(err.to_string());
    }
}

/// One worker's sweeper, coordinator and engine, driven by a polling loop
pub struct OutboxProcessor<S: EnvelopeStore> {
    sweeper: RecoverySweeper<S>,
    coordinator: ClaimCoordinator<S>,
    engine: DispatchEngine<S>,
    config: ProcessorConfig,
}

impl<S: EnvelopeStore> OutboxProcessor<S> {
    pub fn new(
        sweeper: RecoverySweeper<S>,
        coordinator: ClaimCoordinator<S>,
        engine: DispatchEngine<S>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            sweeper,
            coordinator,
            engine,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Run a single cycle: sweep, then claim and dispatch up to `batch_size`
    #[instrument(skip(self, cancel), fields(worker_id = %self.config.worker_id))]
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();
        let worker_id = self.config.worker_id.as_str();

        if cancel.is_cancelled() {
            report.cancelled = true;
            return report;
        }
        match self.sweeper.sweep().await {
            Ok(sweep) => report.sweep = sweep,
            Err(e) => {
                report.fail("sweep", &e);
                return report;
            }
        }

        for _ in 0..self.config.batch_size {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let envelope = match self
                .coordinator
                .claim_next(worker_id, self.config.claim_lease)
                .await
            {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(e) => {
                    report.fail("claim", &e);
                    break;
                }
            };
            report.claimed += 1;

            if cancel.is_cancelled() {
                report.cancelled = true;
                match self.coordinator.release_claim(envelope.id, worker_id).await {
                    Ok(true) => report.released += 1,
                    Ok(false) => {}
                    Err(e) => warn!(
                        envelope_id = %envelope.id,
                        error = %e,
                        "Could not release claim on shutdown, it will expire"
                    ),
                }
                break;
            }

            match self.engine.dispatch(&envelope, worker_id).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    report.fail("dispatch", &e);
                    break;
                }
            }
        }

        if report.claimed > 0 || !report.sweep.is_empty() {
            debug!(
                claimed = report.claimed,
                processed = report.processed,
                retried = report.retried,
                abandoned = report.abandoned,
                "Cycle complete"
            );
        }
        report
    }

    /// Run cycles on the poll interval until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            poll_interval_ms = millis(self.config.poll_interval),
            "🚀 Outbox processor started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let report = self.run_cycle(&cancel).await;
            if report.cancelled || cancel.is_cancelled() {
                break;
            }

            if !self.config.inter_cycle_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.inter_cycle_delay) => {}
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "🛑 Outbox processor stopped");
    }

    /// Spawn the loop onto the current Tokio runtime
    pub fn spawn(self: Arc<Self>) -> ProcessorHandle {
        let cancel = CancellationToken::new();
        let worker_id = self.config.worker_id.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run(token).await });
        ProcessorHandle {
            worker_id,
            cancel,
            task,
        }
    }
}

/// How a shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The loop observed cancellation and exited on its own
    Graceful,
    /// The grace period ran out and the task was aborted
    Aborted,
}

/// Handle to a running processor task
#[derive(Debug)]
pub struct ProcessorHandle {
    worker_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProcessorHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Request cancellation without waiting
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the loop and wait up to `grace` for it to finish
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn shutdown(mut self, grace: Duration) -> Result<ShutdownOutcome> {
        self.cancel.cancel();
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => {
                info!("Outbox processor shut down gracefully");
                Ok(ShutdownOutcome::Graceful)
            }
            Ok(Err(join_error)) if join_error.is_cancelled() => Ok(ShutdownOutcome::Aborted),
            Ok(Err(join_error)) => Err(OutboxError::invalid_state(format!(
                "outbox processor task failed: {join_error}"
            ))),
            Err(_) => {
                warn!(
                    grace_ms = millis(grace),
                    "Grace period expired, aborting outbox processor; in-flight work will be recovered by the sweeper"
                );
                self.task.abort();
                Ok(ShutdownOutcome::Aborted)
            }
        }
    }
}
