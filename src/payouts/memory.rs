//! In-memory ledger
//!
//! Used in development mode (no PostgreSQL) and by the test suite. A single
//! mutex guards intents and audit rows so a transition and its audit entry
//! are applied together.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use super::ledger::{LedgerError, PayoutLedger};
use super::models::{
    AuditAction, AuditActor, IntentPage, PayoutAuditEntry, PayoutId, PayoutIntent, PayoutStatus,
    StatusCount, TransitionRequest,
};

#[derive(Default)]
struct State {
    intents: HashMap<PayoutId, PayoutIntent>,
    by_source: HashMap<String, PayoutId>,
    by_key: HashMap<String, PayoutId>,
    audit: Vec<PayoutAuditEntry>,
    notifications: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PayoutLedger for MemoryLedger {
    async fn insert(&self, intent: &PayoutIntent) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;

        if state.by_source.contains_key(&intent.source_event_id) {
            return Err(LedgerError::Duplicate {
                field: "source_event_id",
                value: intent.source_event_id.clone(),
            });
        }
        if state.by_key.contains_key(&intent.idempotency_key) {
            return Err(LedgerError::Duplicate {
                field: "idempotency_key",
                value: intent.idempotency_key.clone(),
            });
        }

        state
            .by_source
            .insert(intent.source_event_id.clone(), intent.id);
        state.by_key.insert(intent.idempotency_key.clone(), intent.id);
        state.intents.insert(intent.id, intent.clone());
        state.audit.push(PayoutAuditEntry {
            intent_id: intent.id,
            action: AuditAction::Created,
            status_before: None,
            status_after: intent.status,
            message: format!("payout intent created for amount {}", intent.amount),
            actor: AuditActor::System,
            timestamp: intent.created_at,
        });
        Ok(())
    }

    async fn get(&self, id: PayoutId) -> Result<Option<PayoutIntent>, LedgerError> {
        Ok(self.state.lock().await.intents.get(&id).cloned())
    }

    async fn find_by_source_event(
        &self,
        source_event_id: &str,
    ) -> Result<Option<PayoutIntent>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .by_source
            .get(source_event_id)
            .and_then(|id| state.intents.get(id))
            .cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<PayoutIntent>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .by_key
            .get(idempotency_key)
            .and_then(|id| state.intents.get(id))
            .cloned())
    }

    async fn transition(
        &self,
        request: TransitionRequest,
    ) -> Result<Option<PayoutIntent>, LedgerError> {
        if !request.from.can_transition_to(&request.to) {
            return Err(LedgerError::IllegalTransition {
                from: request.from,
                to: request.to,
            });
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let intent = state
            .intents
            .get_mut(&request.intent_id)
            .ok_or(LedgerError::NotFound(request.intent_id))?;

        if intent.status != request.from {
            return Ok(None);
        }
        if let Some(notification_id) = &request.notification_id {
            if !state.notifications.insert(notification_id.clone()) {
                return Ok(None);
            }
        }

        let patch = request.patch;
        intent.status = request.to;
        intent.updated_at = request.at;
        intent.next_check_at = None;
        intent.check_count = 0;
        if let Some(reference) = patch.provider_reference {
            intent.provider_reference = Some(reference);
        }
        if let Some(reason) = patch.failure_reason {
            intent.failure_reason = reason;
        }
        if let Some(next_retry_at) = patch.next_retry_at {
            intent.next_retry_at = next_retry_at;
        }
        if let Some(completed_at) = patch.completed_at {
            intent.completed_at = completed_at;
        }
        if let Some(attempt_count) = patch.attempt_count {
            intent.attempt_count = attempt_count;
        }
        let updated = intent.clone();

        state.audit.push(PayoutAuditEntry {
            intent_id: request.intent_id,
            action: request.action,
            status_before: Some(request.from),
            status_after: request.to,
            message: request.message,
            actor: request.actor,
            timestamp: request.at,
        });

        Ok(Some(updated))
    }

    async fn record_provider_reference(
        &self,
        id: PayoutId,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let mut state = self.state.lock().await;
        let intent = state.intents.get_mut(&id).ok_or(LedgerError::NotFound(id))?;
        if intent.status != PayoutStatus::Submitted || intent.provider_reference.is_some() {
            return Ok(false);
        }
        intent.provider_reference = Some(reference.to_string());
        intent.updated_at = at;
        Ok(true)
    }

    async fn notification_seen(&self, notification_id: &str) -> Result<bool, LedgerError> {
        Ok(self.state.lock().await.notifications.contains(notification_id))
    }

    async fn record_notification(
        &self,
        notification_id: &str,
        intent_id: PayoutId,
        _at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let mut state = self.state.lock().await;
        if !state.intents.contains_key(&intent_id) {
            return Err(LedgerError::NotFound(intent_id));
        }
        Ok(state.notifications.insert(notification_id.to_string()))
    }

    async fn audit_trail(&self, id: PayoutId) -> Result<Vec<PayoutAuditEntry>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .filter(|entry| entry.intent_id == id)
            .cloned()
            .collect())
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PayoutIntent>, LedgerError> {
        let state = self.state.lock().await;
        let mut due: Vec<PayoutIntent> = state
            .intents
            .values()
            .filter(|i| i.status == PayoutStatus::AwaitingRetry)
            .filter(|i| i.next_retry_at.map_or(true, |at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|i| i.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn due_for_check(
        &self,
        status: PayoutStatus,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PayoutIntent>, LedgerError> {
        let state = self.state.lock().await;
        let mut due: Vec<PayoutIntent> = state
            .intents
            .values()
            .filter(|i| i.status == status && i.updated_at < older_than)
            .filter(|i| i.next_check_at.map_or(true, |at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|i| (i.next_check_at.unwrap_or(i.updated_at), i.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn schedule_check(
        &self,
        id: PayoutId,
        status: PayoutStatus,
        next_check_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let mut state = self.state.lock().await;
        let intent = state.intents.get_mut(&id).ok_or(LedgerError::NotFound(id))?;
        if intent.status != status {
            return Ok(false);
        }
        intent.next_check_at = Some(next_check_at);
        intent.check_count = intent.check_count.saturating_add(1);
        Ok(true)
    }

    async fn list_by_beneficiary(
        &self,
        beneficiary_id: &str,
        status: Option<PayoutStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<IntentPage, LedgerError> {
        let state = self.state.lock().await;
        let mut matching: Vec<&PayoutIntent> = state
            .intents
            .values()
            .filter(|i| i.beneficiary_id == beneficiary_id)
            .filter(|i| status.map_or(true, |s| i.status == s))
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.as_uuid().cmp(&a.id.as_uuid()))
        });

        Ok(IntentPage {
            total: matching.len() as u64,
            intents: matching
                .into_iter()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect(),
        })
    }

    async fn count_by_status(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StatusCount>, LedgerError> {
        let state = self.state.lock().await;
        let mut counts = Vec::new();
        for status in PayoutStatus::ALL {
            let (count, total_amount) = state
                .intents
                .values()
                .filter(|i| i.status == status && i.created_at >= from && i.created_at < to)
                .fold((0u64, BigDecimal::from(0)), |(n, sum), i| {
                    (n + 1, sum + &i.amount)
                });
            if count > 0 {
                counts.push(StatusCount {
                    status,
                    count,
                    total_amount,
                });
            }
        }
        Ok(counts)
    }
}
