//! Payout ledger data model
//!
//! `PayoutIntent` is the durable record of an obligation to pay a prize
//! winner; `PayoutAuditEntry` is the append-only trail of its transitions.

use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayoutId(Uuid);

impl PayoutId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PayoutId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PayoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PayoutId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ============================================================================
// State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,
    Submitted,
    AwaitingRetry,
    Succeeded,
    Failed,
}

impl PayoutStatus {
    pub const ALL: [PayoutStatus; 5] = [
        PayoutStatus::Pending,
        PayoutStatus::Submitted,
        PayoutStatus::AwaitingRetry,
        PayoutStatus::Succeeded,
        PayoutStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "PENDING",
            PayoutStatus::Submitted => "SUBMITTED",
            PayoutStatus::AwaitingRetry => "AWAITING_RETRY",
            PayoutStatus::Succeeded => "SUCCEEDED",
            PayoutStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PayoutStatus::Pending),
            "SUBMITTED" => Some(PayoutStatus::Submitted),
            "AWAITING_RETRY" => Some(PayoutStatus::AwaitingRetry),
            "SUCCEEDED" => Some(PayoutStatus::Succeeded),
            "FAILED" => Some(PayoutStatus::Failed),
            _ => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, PayoutStatus::Succeeded | PayoutStatus::Failed)
    }

    /// Validates if a state transition is allowed.
    ///
    /// `Failed -> Pending` is the operator re-open edge; automatic paths
    /// never request it.
    pub fn can_transition_to(&self, next: &PayoutStatus) -> bool {
        match (self, next) {
            (PayoutStatus::Pending, PayoutStatus::Submitted) => true,
            (PayoutStatus::Pending, PayoutStatus::Failed) => true,

            (PayoutStatus::Submitted, PayoutStatus::Succeeded) => true,
            (PayoutStatus::Submitted, PayoutStatus::AwaitingRetry) => true,
            (PayoutStatus::Submitted, PayoutStatus::Failed) => true,

            (PayoutStatus::AwaitingRetry, PayoutStatus::Pending) => true,

            (PayoutStatus::Failed, PayoutStatus::Pending) => true,

            _ => false,
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Created,
    SubmitStarted,
    TransferSucceeded,
    RetryScheduled,
    RetryReleased,
    TransferFailed,
    ValidationFailed,
    WebhookSucceeded,
    WebhookFailed,
    QuerySucceeded,
    QueryFailed,
    ManualRetry,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "CREATED",
            AuditAction::SubmitStarted => "SUBMIT_STARTED",
            AuditAction::TransferSucceeded => "TRANSFER_SUCCEEDED",
            AuditAction::RetryScheduled => "RETRY_SCHEDULED",
            AuditAction::RetryReleased => "RETRY_RELEASED",
            AuditAction::TransferFailed => "TRANSFER_FAILED",
            AuditAction::ValidationFailed => "VALIDATION_FAILED",
            AuditAction::WebhookSucceeded => "WEBHOOK_SUCCEEDED",
            AuditAction::WebhookFailed => "WEBHOOK_FAILED",
            AuditAction::QuerySucceeded => "QUERY_SUCCEEDED",
            AuditAction::QueryFailed => "QUERY_FAILED",
            AuditAction::ManualRetry => "MANUAL_RETRY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(AuditAction::Created),
            "SUBMIT_STARTED" => Some(AuditAction::SubmitStarted),
            "TRANSFER_SUCCEEDED" => Some(AuditAction::TransferSucceeded),
            "RETRY_SCHEDULED" => Some(AuditAction::RetryScheduled),
            "RETRY_RELEASED" => Some(AuditAction::RetryReleased),
            "TRANSFER_FAILED" => Some(AuditAction::TransferFailed),
            "VALIDATION_FAILED" => Some(AuditAction::ValidationFailed),
            "WEBHOOK_SUCCEEDED" => Some(AuditAction::WebhookSucceeded),
            "WEBHOOK_FAILED" => Some(AuditAction::WebhookFailed),
            "QUERY_SUCCEEDED" => Some(AuditAction::QuerySucceeded),
            "QUERY_FAILED" => Some(AuditAction::QueryFailed),
            "MANUAL_RETRY" => Some(AuditAction::ManualRetry),
            _ => None,
        }
    }
}

/// Who caused a transition. Stored as a plain string in the audit table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AuditActor {
    System,
    Worker,
    Scheduler,
    Provider,
    Operator(String),
}

impl AuditActor {
    pub fn as_string(&self) -> String {
        match self {
            AuditActor::System => "system".to_string(),
            AuditActor::Worker => "worker".to_string(),
            AuditActor::Scheduler => "scheduler".to_string(),
            AuditActor::Provider => "provider".to_string(),
            AuditActor::Operator(name) => format!("operator:{}", name),
        }
    }
}

impl From<AuditActor> for String {
    fn from(actor: AuditActor) -> Self {
        actor.as_string()
    }
}

impl From<String> for AuditActor {
    fn from(s: String) -> Self {
        match s.as_str() {
            "system" => AuditActor::System,
            "worker" => AuditActor::Worker,
            "scheduler" => AuditActor::Scheduler,
            "provider" => AuditActor::Provider,
            other => AuditActor::Operator(
                other.strip_prefix("operator:").unwrap_or(other).to_string(),
            ),
        }
    }
}

impl fmt::Display for AuditActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutAuditEntry {
    pub intent_id: PayoutId,
    pub action: AuditAction,
    pub status_before: Option<PayoutStatus>,
    pub status_after: PayoutStatus,
    pub message: String,
    pub actor: AuditActor,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Intent
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutIntent {
    pub id: PayoutId,
    pub beneficiary_id: String,
    pub source_event_id: String,
    pub amount: BigDecimal,
    pub memo: Option<String>,
    pub idempotency_key: String,
    pub provider_reference: Option<String>,
    pub status: PayoutStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// Earliest time the scheduler looks at this intent again (orphan
    /// re-enqueue or provider query). Cleared by every transition.
    pub next_check_at: Option<DateTime<Utc>>,
    /// Scheduler checks since the last transition; drives query backoff.
    pub check_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PayoutIntent {
    /// Build a fresh intent in `PENDING`. The first attempt is attempt 1.
    pub fn new(
        beneficiary_id: String,
        source_event_id: String,
        amount: BigDecimal,
        memo: Option<String>,
        idempotency_key: String,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PayoutId::new(),
            beneficiary_id,
            source_event_id,
            amount,
            memo,
            idempotency_key,
            provider_reference: None,
            status: PayoutStatus::Pending,
            attempt_count: 1,
            max_attempts,
            next_retry_at: None,
            failure_reason: None,
            next_check_at: None,
            check_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Amount in currency minor units (fen), as the provider expects.
    pub fn amount_minor_units(&self) -> Option<i64> {
        to_minor_units(&self.amount)
    }
}

impl fmt::Display for PayoutIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Payout[{}] source={} amount={} status={} attempt={}/{}",
            self.id,
            self.source_event_id,
            self.amount,
            self.status,
            self.attempt_count,
            self.max_attempts
        )
    }
}

/// True when `amount` carries no more than two decimal places.
pub fn has_minor_unit_precision(amount: &BigDecimal) -> bool {
    amount.with_scale(2) == *amount
}

pub fn to_minor_units(amount: &BigDecimal) -> Option<i64> {
    if !has_minor_unit_precision(amount) {
        return None;
    }
    (amount * BigDecimal::from(100)).to_i64()
}

// ============================================================================
// Transition requests
// ============================================================================

/// Field updates applied together with a status change.
#[derive(Debug, Clone, Default)]
pub struct IntentPatch {
    pub provider_reference: Option<String>,
    /// `Some(None)` clears the reason.
    pub failure_reason: Option<Option<String>>,
    /// `Some(None)` clears the retry time.
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    /// `Some(None)` clears the completion time (operator re-open).
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub attempt_count: Option<u32>,
}

/// A guarded compare-and-swap on an intent's status.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub intent_id: PayoutId,
    pub from: PayoutStatus,
    pub to: PayoutStatus,
    pub patch: IntentPatch,
    pub action: AuditAction,
    pub message: String,
    pub actor: AuditActor,
    pub at: DateTime<Utc>,
    /// Provider notification that caused the transition. Recorded with the
    /// transition; a notification id already recorded makes the CAS lose.
    pub notification_id: Option<String>,
}

/// One page of a beneficiary's intents, newest first.
#[derive(Debug, Clone)]
pub struct IntentPage {
    pub intents: Vec<PayoutIntent>,
    pub total: u64,
}

/// Aggregate row for the operational stats endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusCount {
    pub status: PayoutStatus,
    pub count: u64,
    pub total_amount: BigDecimal,
}
