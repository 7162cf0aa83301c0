//! Payout Initiator
//!
//! Entry point for the lottery feature: records a win as a `PENDING` payout
//! intent and hands it to the worker pool. Transfer completion is always
//! asynchronous; callers observe it through [`PayoutInitiator::get_status`].
//! Also hosts the operator and dashboard operations (manual retry, audit
//! trail, beneficiary records, status statistics).

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::PayoutSettings;
use crate::error::PayoutError;
use crate::logging::mask_beneficiary;
use crate::payouts::ledger::LedgerError;
use crate::payouts::models::{
    has_minor_unit_precision, AuditAction, AuditActor, PayoutAuditEntry, PayoutId, PayoutIntent,
    PayoutStatus, StatusCount,
};
use crate::payouts::state_machine::PayoutStateMachine;
use crate::providers::{build_idempotency_key, PayoutGateway};
use crate::queue::{JobPriority, JobQueue, PayoutJob};

/// Column widths of the ledger schema.
const MAX_ID_CHARS: usize = 64;
const MAX_MEMO_CHARS: usize = 255;
/// Audit actors are stored as `operator:{name}` in 64 characters.
const MAX_OPERATOR_CHARS: usize = 55;
/// `NUMERIC(12, 2)` holds amounts below 10^10.
const MAX_STORABLE_AMOUNT: i64 = 10_000_000_000;

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

fn check_length(field: &str, value: &str, max_chars: usize) -> Result<(), PayoutError> {
    if value.chars().count() > max_chars {
        return Err(PayoutError::Validation(format!(
            "{} must be at most {} characters",
            field, max_chars
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitiatorConfig {
    pub max_attempts: u32,
    pub high_value_threshold: BigDecimal,
    pub allow_manual_attempt_reset: bool,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            high_value_threshold: BigDecimal::from(10),
            allow_manual_attempt_reset: false,
        }
    }
}

impl From<&PayoutSettings> for InitiatorConfig {
    fn from(settings: &PayoutSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            high_value_threshold: settings.high_value_threshold.clone(),
            allow_manual_attempt_reset: settings.allow_manual_attempt_reset,
        }
    }
}

/// A win to be paid out.
#[derive(Debug, Clone, Deserialize)]
pub struct InitiatePayout {
    pub beneficiary_id: String,
    pub source_event_id: String,
    pub amount: BigDecimal,
    #[serde(default)]
    pub memo: Option<String>,
}

/// Caller-facing view of an intent.
#[derive(Debug, Clone, Serialize)]
pub struct PayoutStatusView {
    pub intent_id: PayoutId,
    pub source_event_id: String,
    pub status: PayoutStatus,
    pub amount: BigDecimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<PayoutIntent> for PayoutStatusView {
    fn from(intent: PayoutIntent) -> Self {
        Self {
            intent_id: intent.id,
            source_event_id: intent.source_event_id,
            status: intent.status,
            amount: intent.amount,
            provider_reference: intent.provider_reference,
            failure_reason: intent.failure_reason,
            attempt_count: intent.attempt_count,
            max_attempts: intent.max_attempts,
            next_retry_at: intent.next_retry_at,
            created_at: intent.created_at,
            updated_at: intent.updated_at,
            completed_at: intent.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub total: u64,
    pub page: usize,
    pub limit: usize,
    pub total_pages: u64,
}

/// One page of a beneficiary's payout records, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct PayoutRecords {
    pub records: Vec<PayoutStatusView>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize)]
pub struct PayoutStats {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total_count: u64,
    pub by_status: Vec<StatusCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
}

pub struct PayoutInitiator {
    machine: PayoutStateMachine,
    gateway: Arc<dyn PayoutGateway>,
    queue: Arc<dyn JobQueue>,
    config: InitiatorConfig,
}

impl PayoutInitiator {
    pub fn new(
        machine: PayoutStateMachine,
        gateway: Arc<dyn PayoutGateway>,
        queue: Arc<dyn JobQueue>,
        config: InitiatorConfig,
    ) -> Self {
        Self {
            machine,
            gateway,
            queue,
            config,
        }
    }

    /// Record a win and enqueue its first transfer attempt.
    ///
    /// An amount outside the provider bounds is still recorded, then moved
    /// straight to `FAILED`, so the rejection is auditable.
    pub async fn initiate(&self, request: InitiatePayout) -> Result<PayoutIntent, PayoutError> {
        let beneficiary_id = request.beneficiary_id.trim().to_string();
        let source_event_id = request.source_event_id.trim().to_string();
        if beneficiary_id.is_empty() {
            return Err(PayoutError::Validation("beneficiary_id is required".into()));
        }
        if source_event_id.is_empty() {
            return Err(PayoutError::Validation("source_event_id is required".into()));
        }
        check_length("beneficiary_id", &beneficiary_id, MAX_ID_CHARS)?;
        check_length("source_event_id", &source_event_id, MAX_ID_CHARS)?;
        let memo = request
            .memo
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        if let Some(memo) = &memo {
            check_length("memo", memo, MAX_MEMO_CHARS)?;
        }

        if request.amount <= BigDecimal::from(0) || !has_minor_unit_precision(&request.amount) {
            return Err(PayoutError::InvalidAmount {
                amount: request.amount.to_string(),
                reason: "amount must be positive with at most two decimal places".into(),
                intent_id: None,
            });
        }
        if request.amount >= BigDecimal::from(MAX_STORABLE_AMOUNT) {
            return Err(PayoutError::InvalidAmount {
                amount: request.amount.to_string(),
                reason: format!(
                    "amount exceeds the provider bounds {}",
                    self.gateway.limits()
                ),
                intent_id: None,
            });
        }

        if let Some(existing) = self
            .machine
            .ledger()
            .find_by_source_event(&source_event_id)
            .await?
        {
            return Err(PayoutError::DuplicateSourceEvent {
                source_event_id,
                intent_id: Some(existing.id),
            });
        }

        let clock = self.machine.clock();
        let idempotency_key = build_idempotency_key(
            &beneficiary_id,
            &source_event_id,
            clock.monotonic_millis(),
        );
        let intent = PayoutIntent::new(
            beneficiary_id,
            source_event_id,
            request.amount.with_scale(2),
            memo,
            idempotency_key,
            self.config.max_attempts,
            clock.now(),
        );

        match self.machine.ledger().insert(&intent).await {
            Ok(()) => {}
            Err(LedgerError::Duplicate {
                field: "source_event_id",
                ..
            }) => {
                let existing = self
                    .machine
                    .ledger()
                    .find_by_source_event(&intent.source_event_id)
                    .await?;
                return Err(PayoutError::DuplicateSourceEvent {
                    source_event_id: intent.source_event_id,
                    intent_id: existing.map(|i| i.id),
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            intent_id = %intent.id,
            source_event_id = %intent.source_event_id,
            beneficiary = %mask_beneficiary(&intent.beneficiary_id),
            amount = %intent.amount,
            "Payout intent recorded"
        );

        if !self.gateway.validate_amount(&intent.amount) {
            let reason = format!(
                "amount {} outside provider bounds {}",
                intent.amount,
                self.gateway.limits()
            );
            self.machine
                .fail_permanently(
                    &intent,
                    PayoutStatus::Pending,
                    AuditAction::ValidationFailed,
                    AuditActor::System,
                    reason.clone(),
                )
                .await?;
            return Err(PayoutError::InvalidAmount {
                amount: intent.amount.to_string(),
                reason,
                intent_id: Some(intent.id),
            });
        }

        let priority = JobPriority::for_amount(&intent.amount, &self.config.high_value_threshold);
        let job = PayoutJob::new(intent.id, priority, intent.attempt_count, clock.now());
        if let Err(e) = self.queue.enqueue(job).await {
            // Intent stays PENDING; orphan recovery re-enqueues it.
            warn!(intent_id = %intent.id, error = %e, "Failed to enqueue payout job");
        }

        Ok(intent)
    }

    pub async fn get_status(&self, source_event_id: &str) -> Result<PayoutStatusView, PayoutError> {
        let source_event_id = source_event_id.trim();
        self.machine
            .ledger()
            .find_by_source_event(source_event_id)
            .await?
            .map(PayoutStatusView::from)
            .ok_or_else(|| PayoutError::NotFound(format!("payout for source event {}", source_event_id)))
    }

    pub async fn get(&self, intent_id: PayoutId) -> Result<PayoutIntent, PayoutError> {
        self.machine
            .ledger()
            .get(intent_id)
            .await?
            .ok_or_else(|| PayoutError::NotFound(format!("payout intent {}", intent_id)))
    }

    /// Operator-triggered retry of a `FAILED` intent.
    pub async fn retry(&self, intent_id: PayoutId, operator: &str) -> Result<PayoutIntent, PayoutError> {
        let operator = operator.trim();
        if operator.is_empty() {
            return Err(PayoutError::Validation("operator is required".into()));
        }
        check_length("operator", operator, MAX_OPERATOR_CHARS)?;
        let intent = self.get(intent_id).await?;

        if intent.status != PayoutStatus::Failed {
            return Err(PayoutError::RetryRejected {
                intent_id,
                reason: format!("only FAILED payouts can be retried, status is {}", intent.status),
            });
        }

        let attempt_count = if self.config.allow_manual_attempt_reset {
            1
        } else if intent.retries_exhausted() {
            return Err(PayoutError::RetryRejected {
                intent_id,
                reason: format!(
                    "attempt cap reached ({}/{}) and attempt reset is disabled",
                    intent.attempt_count, intent.max_attempts
                ),
            });
        } else {
            intent.attempt_count + 1
        };

        let Some(reopened) = self
            .machine
            .manual_reopen(&intent, operator, attempt_count)
            .await?
        else {
            return Err(PayoutError::RetryRejected {
                intent_id,
                reason: "payout status changed concurrently".into(),
            });
        };

        let job = PayoutJob::new(
            reopened.id,
            JobPriority::MANUAL,
            reopened.attempt_count,
            self.machine.clock().now(),
        );
        if let Err(e) = self.queue.enqueue(job).await {
            warn!(intent_id = %reopened.id, error = %e, "Failed to enqueue manual retry");
        }

        info!(intent_id = %reopened.id, operator = %operator, "Manual payout retry accepted");
        Ok(reopened)
    }

    pub async fn audit_trail(&self, intent_id: PayoutId) -> Result<Vec<PayoutAuditEntry>, PayoutError> {
        self.get(intent_id).await?;
        Ok(self.machine.ledger().audit_trail(intent_id).await?)
    }

    /// A beneficiary's payout records, newest first. `page` starts at 1.
    pub async fn list(
        &self,
        beneficiary_id: &str,
        status: Option<PayoutStatus>,
        page: usize,
        limit: usize,
    ) -> Result<PayoutRecords, PayoutError> {
        let beneficiary_id = beneficiary_id.trim();
        if beneficiary_id.is_empty() {
            return Err(PayoutError::Validation("beneficiary_id is required".into()));
        }
        if page == 0 {
            return Err(PayoutError::Validation("page starts at 1".into()));
        }
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(PayoutError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        let offset = (page - 1).saturating_mul(limit);
        let found = self
            .machine
            .ledger()
            .list_by_beneficiary(beneficiary_id, status, limit, offset)
            .await?;

        Ok(PayoutRecords {
            records: found.intents.into_iter().map(PayoutStatusView::from).collect(),
            pagination: Pagination {
                total: found.total,
                page,
                limit,
                total_pages: found.total.div_ceil(limit as u64),
            },
        })
    }

    /// Counts and amounts per status for intents created in `[from, to)`.
    pub async fn stats(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<PayoutStats, PayoutError> {
        if from >= to {
            return Err(PayoutError::Validation("`from` must be before `to`".into()));
        }

        let by_status = self.machine.ledger().count_by_status(from, to).await?;
        let total_count = by_status.iter().map(|c| c.count).sum();
        let queue_depth = match self.queue.depth().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                warn!(error = %e, "Failed to read queue depth");
                None
            }
        };

        Ok(PayoutStats {
            from,
            to,
            total_count,
            by_status,
            queue_depth,
        })
    }
}
