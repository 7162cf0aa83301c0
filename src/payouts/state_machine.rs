//! Guarded payout transitions
//!
//! Every component that moves an intent (worker, scheduler, webhook
//! reconciler, initiator) goes through [`PayoutStateMachine`]. Each method is
//! one compare-and-swap on the ledger; `Ok(None)` means another actor already
//! moved the intent and the caller must treat the event as handled.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use super::ledger::{LedgerError, PayoutLedger};
use super::models::{
    AuditAction, AuditActor, IntentPatch, PayoutIntent, PayoutStatus, TransitionRequest,
};
use crate::clock::Clock;
use crate::workers::retry_scheduler::RetryPolicy;

pub type TransitionResult = Result<Option<PayoutIntent>, LedgerError>;

#[derive(Clone)]
pub struct PayoutStateMachine {
    ledger: Arc<dyn PayoutLedger>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
}

impl PayoutStateMachine {
    pub fn new(ledger: Arc<dyn PayoutLedger>, clock: Arc<dyn Clock>, retry_policy: RetryPolicy) -> Self {
        Self {
            ledger,
            clock,
            retry_policy,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn PayoutLedger> {
        &self.ledger
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// `PENDING -> SUBMITTED`, persisted before the provider is called.
    pub async fn begin_submission(&self, intent: &PayoutIntent) -> TransitionResult {
        self.apply(
            intent,
            PayoutStatus::Pending,
            PayoutStatus::Submitted,
            IntentPatch::default(),
            AuditAction::SubmitStarted,
            format!("submitting attempt {}/{}", intent.attempt_count, intent.max_attempts),
            AuditActor::Worker,
        )
        .await
    }

    /// `SUBMITTED -> SUCCEEDED`.
    pub async fn complete(
        &self,
        intent: &PayoutIntent,
        provider_reference: Option<String>,
        action: AuditAction,
        actor: AuditActor,
        message: String,
    ) -> TransitionResult {
        self.complete_notified(intent, provider_reference, action, actor, message, None)
            .await
    }

    /// [`complete`](Self::complete) on behalf of a provider notification.
    /// Loses when `notification_id` was already applied.
    pub async fn complete_notified(
        &self,
        intent: &PayoutIntent,
        provider_reference: Option<String>,
        action: AuditAction,
        actor: AuditActor,
        message: String,
        notification_id: Option<String>,
    ) -> TransitionResult {
        let now = self.clock.now();
        let patch = IntentPatch {
            provider_reference,
            failure_reason: Some(None),
            completed_at: Some(Some(now)),
            ..Default::default()
        };
        self.apply_at(
            intent,
            PayoutStatus::Submitted,
            PayoutStatus::Succeeded,
            patch,
            action,
            message,
            actor,
            now,
            notification_id,
        )
        .await
    }

    /// Straight to `FAILED` with no retry. Used for deterministic rejections
    /// (`from` is `PENDING` for validation failures, `SUBMITTED` for
    /// provider rejections).
    pub async fn fail_permanently(
        &self,
        intent: &PayoutIntent,
        from: PayoutStatus,
        action: AuditAction,
        actor: AuditActor,
        reason: String,
    ) -> TransitionResult {
        self.fail_terminal(intent, from, action, actor, reason, None)
            .await
    }

    async fn fail_terminal(
        &self,
        intent: &PayoutIntent,
        from: PayoutStatus,
        action: AuditAction,
        actor: AuditActor,
        reason: String,
        notification_id: Option<String>,
    ) -> TransitionResult {
        let now = self.clock.now();
        let patch = IntentPatch {
            failure_reason: Some(Some(reason.clone())),
            next_retry_at: Some(None),
            completed_at: Some(Some(now)),
            ..Default::default()
        };
        self.apply_at(
            intent,
            from,
            PayoutStatus::Failed,
            patch,
            action,
            reason,
            actor,
            now,
            notification_id,
        )
        .await
    }

    /// `SUBMITTED -> AWAITING_RETRY` while attempts remain, otherwise
    /// `SUBMITTED -> FAILED`.
    pub async fn fail_with_cap(
        &self,
        intent: &PayoutIntent,
        action: AuditAction,
        actor: AuditActor,
        reason: String,
    ) -> TransitionResult {
        self.fail_with_cap_notified(intent, action, actor, reason, None)
            .await
    }

    /// [`fail_with_cap`](Self::fail_with_cap) on behalf of a provider
    /// notification.
    pub async fn fail_with_cap_notified(
        &self,
        intent: &PayoutIntent,
        action: AuditAction,
        actor: AuditActor,
        reason: String,
        notification_id: Option<String>,
    ) -> TransitionResult {
        if intent.retries_exhausted() {
            let message = format!(
                "{} (attempt {}/{}, retries exhausted)",
                reason, intent.attempt_count, intent.max_attempts
            );
            return self
                .fail_terminal(
                    intent,
                    PayoutStatus::Submitted,
                    action,
                    actor,
                    message,
                    notification_id,
                )
                .await;
        }

        let now = self.clock.now();
        let delay = self.retry_policy.delay_for(intent.attempt_count);
        let next_retry_at = now + to_chrono(delay);
        let patch = IntentPatch {
            failure_reason: Some(Some(reason.clone())),
            next_retry_at: Some(Some(next_retry_at)),
            ..Default::default()
        };
        let message = format!(
            "{} (attempt {}/{}, retry in {}ms)",
            reason,
            intent.attempt_count,
            intent.max_attempts,
            delay.as_millis()
        );
        self.apply_at(
            intent,
            PayoutStatus::Submitted,
            PayoutStatus::AwaitingRetry,
            patch,
            AuditAction::RetryScheduled,
            message,
            actor,
            now,
            notification_id,
        )
        .await
    }

    /// `AWAITING_RETRY -> PENDING` with the next attempt number.
    pub async fn release_retry(&self, intent: &PayoutIntent) -> TransitionResult {
        let next_attempt = (intent.attempt_count + 1).min(intent.max_attempts);
        let patch = IntentPatch {
            next_retry_at: Some(None),
            attempt_count: Some(next_attempt),
            ..Default::default()
        };
        self.apply(
            intent,
            PayoutStatus::AwaitingRetry,
            PayoutStatus::Pending,
            patch,
            AuditAction::RetryReleased,
            format!("retry released for attempt {}/{}", next_attempt, intent.max_attempts),
            AuditActor::Scheduler,
        )
        .await
    }

    /// Operator re-open, `FAILED -> PENDING`.
    pub async fn manual_reopen(
        &self,
        intent: &PayoutIntent,
        operator: &str,
        attempt_count: u32,
    ) -> TransitionResult {
        let patch = IntentPatch {
            failure_reason: Some(None),
            completed_at: Some(None),
            next_retry_at: Some(None),
            attempt_count: Some(attempt_count),
            ..Default::default()
        };
        self.apply(
            intent,
            PayoutStatus::Failed,
            PayoutStatus::Pending,
            patch,
            AuditAction::ManualRetry,
            format!(
                "manual retry requested, attempt {}/{}",
                attempt_count, intent.max_attempts
            ),
            AuditActor::Operator(operator.to_string()),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        intent: &PayoutIntent,
        from: PayoutStatus,
        to: PayoutStatus,
        patch: IntentPatch,
        action: AuditAction,
        message: String,
        actor: AuditActor,
    ) -> TransitionResult {
        let now = self.clock.now();
        self.apply_at(intent, from, to, patch, action, message, actor, now, None)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_at(
        &self,
        intent: &PayoutIntent,
        from: PayoutStatus,
        to: PayoutStatus,
        patch: IntentPatch,
        action: AuditAction,
        message: String,
        actor: AuditActor,
        at: DateTime<Utc>,
        notification_id: Option<String>,
    ) -> TransitionResult {
        let actor_label = actor.as_string();
        let request = TransitionRequest {
            intent_id: intent.id,
            from,
            to,
            patch,
            action,
            message,
            actor,
            at,
            notification_id,
        };

        let updated = self.ledger.transition(request).await?;
        match &updated {
            Some(_) => info!(
                intent_id = %intent.id,
                from = %from,
                to = %to,
                action = action.as_str(),
                actor = %actor_label,
                "Payout state transition"
            ),
            None => warn!(
                intent_id = %intent.id,
                expected = %from,
                to = %to,
                action = action.as_str(),
                "Payout transition skipped - status already changed"
            ),
        }
        Ok(updated)
    }
}

fn to_chrono(delay: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::hours(1))
}
