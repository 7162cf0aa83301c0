//! Payout Processor Worker
//!
//! Pulls payout jobs off the queue and drives each intent through the
//! provider:
//! - `PENDING -> SUBMITTED` is persisted before the provider is called
//! - the submit call is bounded by a timeout; a timeout is a transient error
//! - the closed [`SubmitOutcome`] decides the next state
//!
//! At most `concurrency` submit calls are in flight. A job whose intent is no
//! longer `PENDING` is dropped without touching the provider.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::config::PayoutSettings;
use crate::log_performance;
use crate::logging::mask_beneficiary;
use crate::payouts::ledger::LedgerError;
use crate::payouts::models::{AuditAction, AuditActor, PayoutIntent, PayoutStatus};
use crate::payouts::state_machine::PayoutStateMachine;
use crate::providers::{PayoutGateway, SubmitOutcome};
use crate::queue::{JobQueue, PayoutJob, QueueError};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct PayoutProcessorConfig {
    /// Maximum number of in-flight submit calls
    pub concurrency: usize,
    /// Upper bound on a single provider submit
    pub job_timeout: Duration,
    /// Wait between queue polls when the queue is empty
    pub poll_interval: Duration,
}

impl Default for PayoutProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            job_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl From<&PayoutSettings> for PayoutProcessorConfig {
    fn from(settings: &PayoutSettings) -> Self {
        Self {
            concurrency: settings.concurrency.max(1),
            job_timeout: settings.job_timeout(),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// What happened to a single job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Intent no longer `PENDING` at pickup (duplicate or stale job).
    Skipped(PayoutStatus),
    IntentMissing,
    /// Another worker moved the intent first.
    LostRace,
    ValidationFailed,
    Succeeded,
    /// Accepted by the provider; final result arrives by webhook or query.
    AwaitingConfirmation,
    RetryScheduled,
    Failed,
}

// ============================================================================
// Processor Worker
// ============================================================================

pub struct PayoutProcessor {
    machine: PayoutStateMachine,
    gateway: Arc<dyn PayoutGateway>,
    queue: Arc<dyn JobQueue>,
    config: PayoutProcessorConfig,
}

impl PayoutProcessor {
    pub fn new(
        machine: PayoutStateMachine,
        gateway: Arc<dyn PayoutGateway>,
        queue: Arc<dyn JobQueue>,
        config: PayoutProcessorConfig,
    ) -> Self {
        Self {
            machine,
            gateway,
            queue,
            config,
        }
    }

    /// Dispatch loop. Returns after shutdown once in-flight jobs finish.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            concurrency = self.config.concurrency,
            job_timeout_ms = self.config.job_timeout.as_millis() as u64,
            gateway = self.gateway.name(),
            "Payout processor started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight = JoinSet::new();

        loop {
            while let Some(result) = in_flight.try_join_next() {
                if let Err(e) = result {
                    error!(error = %e, "Payout job task panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown_rx.changed() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let idle = match self.queue.dequeue().await {
                Ok(Some(job)) => {
                    let this = Arc::clone(&self);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        this.handle_job(job).await;
                    });
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!(error = %e, "Failed to dequeue payout job");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(in_flight = in_flight.len(), "Payout processor draining in-flight jobs");
        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Payout job task panicked");
            }
        }
        info!("Payout processor stopped");
    }

    /// Process queued jobs one by one until the queue is empty.
    pub async fn drain(&self) -> Result<Vec<JobOutcome>, ProcessorError> {
        let mut outcomes = Vec::new();
        while let Some(job) = self.queue.dequeue().await? {
            outcomes.push(self.process_job(&job).await?);
        }
        Ok(outcomes)
    }

    async fn handle_job(&self, job: PayoutJob) {
        match self.process_job(&job).await {
            Ok(outcome) => debug!(intent_id = %job.intent_id, outcome = ?outcome, "Payout job finished"),
            Err(e) => error!(intent_id = %job.intent_id, error = %e, "Payout job failed"),
        }
    }

    #[instrument(skip(self, job), fields(intent_id = %job.intent_id, job_id = %job.job_id))]
    pub async fn process_job(&self, job: &PayoutJob) -> Result<JobOutcome, ProcessorError> {
        let Some(intent) = self.machine.ledger().get(job.intent_id).await? else {
            warn!("Payout job references unknown intent");
            return Ok(JobOutcome::IntentMissing);
        };

        if intent.status != PayoutStatus::Pending {
            debug!(status = %intent.status, "Intent not pending, dropping job");
            return Ok(JobOutcome::Skipped(intent.status));
        }

        if let Some(reason) = self.validation_failure(&intent) {
            let failed = self
                .machine
                .fail_permanently(
                    &intent,
                    PayoutStatus::Pending,
                    AuditAction::ValidationFailed,
                    AuditActor::Worker,
                    reason,
                )
                .await?;
            return Ok(if failed.is_some() {
                JobOutcome::ValidationFailed
            } else {
                JobOutcome::LostRace
            });
        }

        let Some(submitted) = self.machine.begin_submission(&intent).await? else {
            return Ok(JobOutcome::LostRace);
        };

        info!(
            beneficiary = %mask_beneficiary(&submitted.beneficiary_id),
            amount = %submitted.amount,
            attempt = submitted.attempt_count,
            "Submitting payout to provider"
        );

        let started = Instant::now();
        let outcome = match timeout(self.config.job_timeout, self.gateway.submit(&submitted)).await {
            Ok(outcome) => outcome,
            Err(_) => SubmitOutcome::TransientError {
                reason: format!(
                    "provider submit timed out after {}ms",
                    self.config.job_timeout.as_millis()
                ),
            },
        };
        log_performance!(
            operation = "provider_submit",
            duration_ms = started.elapsed().as_millis(),
            gateway = self.gateway.name(),
        );

        self.apply_submit_outcome(&submitted, outcome).await
    }

    fn validation_failure(&self, intent: &PayoutIntent) -> Option<String> {
        if intent.beneficiary_id.trim().is_empty() {
            return Some("missing beneficiary identity".to_string());
        }
        if !self.gateway.validate_amount(&intent.amount) {
            return Some(format!(
                "amount {} outside provider bounds {}",
                intent.amount,
                self.gateway.limits()
            ));
        }
        None
    }

    async fn apply_submit_outcome(
        &self,
        submitted: &PayoutIntent,
        outcome: SubmitOutcome,
    ) -> Result<JobOutcome, ProcessorError> {
        match outcome {
            SubmitOutcome::Accepted {
                reference,
                settled: true,
            } => {
                let done = self
                    .machine
                    .complete(
                        submitted,
                        Some(reference),
                        AuditAction::TransferSucceeded,
                        AuditActor::Worker,
                        "provider settled transfer synchronously".to_string(),
                    )
                    .await?;
                Ok(if done.is_some() {
                    JobOutcome::Succeeded
                } else {
                    JobOutcome::LostRace
                })
            }
            SubmitOutcome::Accepted {
                reference,
                settled: false,
            } => {
                let now = self.machine.clock().now();
                let recorded = self
                    .machine
                    .ledger()
                    .record_provider_reference(submitted.id, &reference, now)
                    .await?;
                if !recorded {
                    debug!(reference = %reference, "Intent already resolved when reference arrived");
                }
                Ok(JobOutcome::AwaitingConfirmation)
            }
            SubmitOutcome::Rejected { reason } => {
                let failed = self
                    .machine
                    .fail_permanently(
                        submitted,
                        PayoutStatus::Submitted,
                        AuditAction::TransferFailed,
                        AuditActor::Worker,
                        format!("provider rejected transfer: {}", reason),
                    )
                    .await?;
                Ok(if failed.is_some() {
                    JobOutcome::Failed
                } else {
                    JobOutcome::LostRace
                })
            }
            SubmitOutcome::TransientError { reason } => {
                let updated = self
                    .machine
                    .fail_with_cap(
                        submitted,
                        AuditAction::TransferFailed,
                        AuditActor::Worker,
                        reason,
                    )
                    .await?;
                Ok(match updated.map(|i| i.status) {
                    Some(PayoutStatus::AwaitingRetry) => JobOutcome::RetryScheduled,
                    Some(_) => JobOutcome::Failed,
                    None => JobOutcome::LostRace,
                })
            }
        }
    }
}
