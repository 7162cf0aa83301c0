//! Retry Scheduler
//!
//! Periodic companion of the payout processor. Each cycle:
//! - releases `AWAITING_RETRY` intents whose delay has elapsed back to
//!   `PENDING` and enqueues them with the same idempotency key
//! - re-enqueues orphaned `PENDING` intents that never reached the queue
//! - queries the provider for `SUBMITTED` intents that have gone quiet
//!
//! Every step is a guarded ledger transition, so several scheduler instances
//! may run side by side. Intents that are looked at without a transition get
//! a `next_check_at` in the ledger, so each batch moves on to intents not yet
//! looked at and repeated provider queries back off.

use bigdecimal::BigDecimal;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PayoutSettings;
use crate::payouts::ledger::LedgerError;
use crate::payouts::models::{AuditAction, AuditActor, PayoutIntent, PayoutStatus};
use crate::payouts::state_machine::PayoutStateMachine;
use crate::providers::{PayoutGateway, QueryOutcome};
use crate::queue::{JobPriority, JobQueue, PayoutJob, QueueError};

// ============================================================================
// Backoff Policy
// ============================================================================

/// `delay = base * 2^attempt_count`, capped at `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    ceiling: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
        }
    }

    pub fn from_settings(settings: &PayoutSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.retry_base_ms),
            Duration::from_millis(settings.retry_ceiling_ms),
        )
    }

    /// Delay before the attempt that follows a failure of `attempt_count`.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt_count).unwrap_or(u64::MAX);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor)).min(self.ceiling)
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(5_000), Duration::from_secs(3_600))
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetrySchedulerConfig {
    pub interval: Duration,
    pub batch_size: usize,
    /// `PENDING` intents untouched for this long are re-enqueued.
    pub orphan_after: Duration,
    /// `SUBMITTED` intents untouched for this long are queried at the provider.
    pub stale_submission_after: Duration,
    /// Upper bound on the wait between queries of one unsettled submission.
    /// The wait starts at `stale_submission_after` and doubles per query.
    pub query_backoff_ceiling: Duration,
    pub query_timeout: Duration,
    pub high_value_threshold: BigDecimal,
}

impl Default for RetrySchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
            orphan_after: Duration::from_secs(120),
            stale_submission_after: Duration::from_secs(600),
            query_backoff_ceiling: Duration::from_secs(3_600),
            query_timeout: Duration::from_secs(30),
            high_value_threshold: BigDecimal::from(10),
        }
    }
}

impl From<&PayoutSettings> for RetrySchedulerConfig {
    fn from(settings: &PayoutSettings) -> Self {
        Self {
            interval: Duration::from_millis(settings.scheduler_interval_ms),
            orphan_after: Duration::from_secs(settings.orphan_after_secs),
            stale_submission_after: Duration::from_secs(settings.stale_submission_secs),
            query_backoff_ceiling: Duration::from_secs(settings.query_backoff_ceiling_secs),
            query_timeout: settings.job_timeout(),
            high_value_threshold: settings.high_value_threshold.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// What one scheduler cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerReport {
    pub released: usize,
    pub orphans_requeued: usize,
    pub reconciled: usize,
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct RetryScheduler {
    machine: PayoutStateMachine,
    gateway: Arc<dyn PayoutGateway>,
    queue: Arc<dyn JobQueue>,
    config: RetrySchedulerConfig,
    query_backoff: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(
        machine: PayoutStateMachine,
        gateway: Arc<dyn PayoutGateway>,
        queue: Arc<dyn JobQueue>,
        config: RetrySchedulerConfig,
    ) -> Self {
        let query_backoff =
            RetryPolicy::new(config.stale_submission_after, config.query_backoff_ceiling);
        Self {
            machine,
            gateway,
            queue,
            config,
            query_backoff,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Retry scheduler started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Retry scheduler cycle failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Retry scheduler received shutdown signal");
                    break;
                }
            }
        }

        info!("Retry scheduler stopped");
    }

    #[instrument(skip(self), name = "retry_scheduler_cycle")]
    pub async fn run_cycle(&self) -> Result<SchedulerReport, SchedulerError> {
        let report = SchedulerReport {
            released: self.release_due_retries().await?,
            orphans_requeued: self.recover_orphans().await?,
            reconciled: self.reconcile_stale_submissions().await?,
        };

        if report != SchedulerReport::default() {
            info!(
                released = report.released,
                orphans_requeued = report.orphans_requeued,
                reconciled = report.reconciled,
                "Retry scheduler cycle completed"
            );
        }
        Ok(report)
    }

    /// `AWAITING_RETRY -> PENDING` for every due intent, then enqueue.
    async fn release_due_retries(&self) -> Result<usize, SchedulerError> {
        let now = self.machine.clock().now();
        let due = self
            .machine
            .ledger()
            .due_retries(now, self.config.batch_size)
            .await?;

        let mut released = 0;
        for intent in due {
            let Some(pending) = self.machine.release_retry(&intent).await? else {
                continue;
            };
            self.queue
                .enqueue(PayoutJob::new(
                    pending.id,
                    JobPriority::HIGH,
                    pending.attempt_count,
                    now,
                ))
                .await?;
            released += 1;
        }
        Ok(released)
    }

    /// Re-enqueue `PENDING` intents that have made no progress.
    async fn recover_orphans(&self) -> Result<usize, SchedulerError> {
        let now = self.machine.clock().now();
        let window = to_chrono(self.config.orphan_after);
        let orphans = self
            .machine
            .ledger()
            .due_for_check(PayoutStatus::Pending, now - window, now, self.config.batch_size)
            .await?;

        let mut requeued = 0;
        for intent in orphans {
            warn!(
                intent_id = %intent.id,
                updated_at = %intent.updated_at,
                "Re-enqueueing orphaned pending payout"
            );
            let priority = JobPriority::for_amount(&intent.amount, &self.config.high_value_threshold);
            self.queue
                .enqueue(PayoutJob::new(intent.id, priority, intent.attempt_count, now))
                .await?;
            self.machine
                .ledger()
                .schedule_check(intent.id, PayoutStatus::Pending, now + window)
                .await?;
            requeued += 1;
        }
        Ok(requeued)
    }

    /// Ask the provider about `SUBMITTED` intents with no confirmation yet.
    async fn reconcile_stale_submissions(&self) -> Result<usize, SchedulerError> {
        let now = self.machine.clock().now();
        let stale = self
            .machine
            .ledger()
            .due_for_check(
                PayoutStatus::Submitted,
                now - to_chrono(self.config.stale_submission_after),
                now,
                self.config.batch_size,
            )
            .await?;

        let mut reconciled = 0;
        for intent in stale {
            let outcome = match timeout(
                self.config.query_timeout,
                self.gateway.query(&intent.idempotency_key),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => QueryOutcome::TransientError {
                    reason: format!(
                        "provider query timed out after {}ms",
                        self.config.query_timeout.as_millis()
                    ),
                },
            };

            if self.apply_query_outcome(&intent, outcome).await? {
                reconciled += 1;
            } else {
                let next_check_at =
                    now + to_chrono(self.query_backoff.delay_for(intent.check_count));
                self.machine
                    .ledger()
                    .schedule_check(intent.id, PayoutStatus::Submitted, next_check_at)
                    .await?;
                debug!(
                    intent_id = %intent.id,
                    check_count = intent.check_count + 1,
                    next_check_at = %next_check_at,
                    "Unsettled submission will be queried again"
                );
            }
        }
        Ok(reconciled)
    }

    async fn apply_query_outcome(
        &self,
        intent: &PayoutIntent,
        outcome: QueryOutcome,
    ) -> Result<bool, SchedulerError> {
        let applied = match outcome {
            QueryOutcome::Succeeded { reference } => self
                .machine
                .complete(
                    intent,
                    Some(reference),
                    AuditAction::QuerySucceeded,
                    AuditActor::Scheduler,
                    "provider query reports transfer finished".to_string(),
                )
                .await?,
            QueryOutcome::Failed { reason, .. } => self
                .machine
                .fail_with_cap(
                    intent,
                    AuditAction::QueryFailed,
                    AuditActor::Scheduler,
                    format!("provider closed transfer: {}", reason),
                )
                .await?,
            QueryOutcome::NotFound => self
                .machine
                .fail_with_cap(
                    intent,
                    AuditAction::QueryFailed,
                    AuditActor::Scheduler,
                    "transfer not found at provider".to_string(),
                )
                .await?,
            QueryOutcome::Processing => {
                debug!(intent_id = %intent.id, "Provider still processing transfer");
                None
            }
            QueryOutcome::TransientError { reason } => {
                warn!(intent_id = %intent.id, reason = %reason, "Provider query failed");
                None
            }
        };
        Ok(applied.is_some())
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(365))
}
