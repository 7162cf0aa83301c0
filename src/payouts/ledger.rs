//! Payout ledger storage contract
//!
//! The ledger is the single source of truth for payout state. Every status
//! change goes through [`PayoutLedger::transition`], a single-row conditional
//! update that writes exactly one audit entry when it wins and nothing when
//! the expected status is stale.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{
    IntentPage, PayoutAuditEntry, PayoutId, PayoutIntent, PayoutStatus, StatusCount,
    TransitionRequest,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("duplicate {field}: {value}")]
    Duplicate { field: &'static str, value: String },

    #[error("payout intent not found: {0}")]
    NotFound(PayoutId),

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: PayoutStatus, to: PayoutStatus },

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait PayoutLedger: Send + Sync {
    /// Insert a new intent together with its `CREATED` audit entry.
    ///
    /// Fails with [`LedgerError::Duplicate`] when the source event or the
    /// idempotency key is already recorded.
    async fn insert(&self, intent: &PayoutIntent) -> Result<(), LedgerError>;

    async fn get(&self, id: PayoutId) -> Result<Option<PayoutIntent>, LedgerError>;

    async fn find_by_source_event(
        &self,
        source_event_id: &str,
    ) -> Result<Option<PayoutIntent>, LedgerError>;

    async fn find_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<PayoutIntent>, LedgerError>;

    /// Compare-and-swap on `status`. Returns the updated intent, or `None`
    /// when the intent is no longer in `request.from` or when
    /// `request.notification_id` was already recorded.
    ///
    /// A won transition clears `next_check_at` and `check_count`.
    async fn transition(
        &self,
        request: TransitionRequest,
    ) -> Result<Option<PayoutIntent>, LedgerError>;

    /// Store the provider's reference while the intent is `SUBMITTED` and
    /// has none yet. Not a transition, so no audit entry.
    async fn record_provider_reference(
        &self,
        id: PayoutId,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Whether a provider notification id has already been processed.
    async fn notification_seen(&self, notification_id: &str) -> Result<bool, LedgerError>;

    /// Record a notification that was handled without a transition. Returns
    /// false when it was already recorded.
    async fn record_notification(
        &self,
        notification_id: &str,
        intent_id: PayoutId,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    async fn audit_trail(&self, id: PayoutId) -> Result<Vec<PayoutAuditEntry>, LedgerError>;

    /// `AWAITING_RETRY` intents whose `next_retry_at` has elapsed.
    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PayoutIntent>, LedgerError>;

    /// Intents in `status` not updated since `older_than` whose
    /// `next_check_at` is unset or has elapsed at `now`, ordered by
    /// `COALESCE(next_check_at, updated_at)`.
    async fn due_for_check(
        &self,
        status: PayoutStatus,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PayoutIntent>, LedgerError>;

    /// Push the next scheduler check of an intent still in `status` to
    /// `next_check_at` and bump `check_count`. Not a transition, so no audit
    /// entry and `updated_at` is left alone.
    async fn schedule_check(
        &self,
        id: PayoutId,
        status: PayoutStatus,
        next_check_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// A beneficiary's intents, newest first, optionally filtered by status.
    async fn list_by_beneficiary(
        &self,
        beneficiary_id: &str,
        status: Option<PayoutStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<IntentPage, LedgerError>;

    /// Counts and amounts per status for intents created in `[from, to)`.
    async fn count_by_status(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StatusCount>, LedgerError>;
}
