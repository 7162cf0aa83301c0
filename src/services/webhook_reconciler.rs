//! Webhook Reconciler
//!
//! Applies provider transfer notifications to the ledger. Deliveries are
//! matched by idempotency key (`out_batch_no`), never by provider reference,
//! since a webhook can race ahead of the synchronous submit response.
//! Duplicate and out-of-order deliveries are harmless: every matched
//! notification id is recorded in the ledger (atomically with the transition
//! it caused), transitions are guarded on `SUBMITTED`, and terminal intents
//! are never touched. The idempotency key is reused across attempts, so the
//! notification id is what ties a delivery to the attempt it reported on.

use http::HeaderMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::WebhookError;
use crate::logging::redact_sensitive_data;
use crate::payouts::models::{AuditAction, AuditActor, PayoutId, PayoutIntent, PayoutStatus};
use crate::payouts::state_machine::PayoutStateMachine;
use crate::providers::types::{EVENT_TRANSFER_CLOSED, EVENT_TRANSFER_SUCCESS};
use crate::providers::{PayoutGateway, TransferNotification, WebhookEnvelope, WebhookHeaders};

/// How an accepted delivery was handled. Every variant is acknowledged to the
/// provider with success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookAck {
    Applied {
        intent_id: PayoutId,
        status: PayoutStatus,
    },
    /// Intent already terminal; the delivery is a duplicate or arrived late.
    AlreadySettled {
        intent_id: PayoutId,
        status: PayoutStatus,
    },
    /// Intent exists but is not awaiting a provider result (e.g. waiting for
    /// a retry). The next submit reuses the idempotency key.
    Deferred {
        intent_id: PayoutId,
        status: PayoutStatus,
    },
    /// Notification id already processed.
    Duplicate { notification_id: String },
    /// Closure of a provider batch other than the one currently submitted.
    StaleBatch {
        intent_id: PayoutId,
        batch_id: String,
    },
    /// No intent carries this idempotency key.
    Unmatched { out_batch_no: String },
    /// Event type this pipeline does not act on.
    Ignored { event_type: String },
}

enum TransferResult {
    Succeeded,
    Closed(String),
}

pub struct WebhookReconciler {
    machine: PayoutStateMachine,
    gateway: Arc<dyn PayoutGateway>,
}

impl WebhookReconciler {
    pub fn new(machine: PayoutStateMachine, gateway: Arc<dyn PayoutGateway>) -> Self {
        Self { machine, gateway }
    }

    #[instrument(skip_all, fields(gateway = self.gateway.name()))]
    pub async fn handle(&self, headers: &HeaderMap, raw_body: &[u8]) -> Result<WebhookAck, WebhookError> {
        let Some(auth) = WebhookHeaders::from_header_map(headers) else {
            warn!("Webhook rejected: missing signature headers");
            return Err(WebhookError::InvalidSignature);
        };
        if !self.gateway.verify_signature(&auth, raw_body) {
            warn!(serial = ?auth.serial, "Webhook rejected: signature verification failed");
            return Err(WebhookError::InvalidSignature);
        }

        debug!(
            body = %redact_sensitive_data(&String::from_utf8_lossy(raw_body)),
            "Verified webhook delivery"
        );

        let envelope: WebhookEnvelope = serde_json::from_slice(raw_body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        let event_type = envelope.event_type.as_str();
        if event_type != EVENT_TRANSFER_SUCCESS && event_type != EVENT_TRANSFER_CLOSED {
            info!(event_type = %event_type, "Ignoring webhook event type");
            return Ok(WebhookAck::Ignored {
                event_type: event_type.to_string(),
            });
        }

        let notification_id = envelope.id.clone().filter(|id| !id.trim().is_empty());
        if let Some(id) = &notification_id {
            if self.machine.ledger().notification_seen(id).await? {
                info!(notification_id = %id, "Duplicate webhook delivery, no-op");
                return Ok(WebhookAck::Duplicate {
                    notification_id: id.clone(),
                });
            }
        }

        let decrypted = self
            .gateway
            .decrypt_payload(&envelope.resource)
            .map_err(|e| {
                warn!(error = %e, "Webhook rejected: payload decryption failed");
                WebhookError::Decryption(e)
            })?;
        let notification: TransferNotification = serde_json::from_value(decrypted)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        let result = if envelope.event_type == EVENT_TRANSFER_SUCCESS {
            TransferResult::Succeeded
        } else {
            TransferResult::Closed(
                notification
                    .close_reason
                    .clone()
                    .unwrap_or_else(|| "transfer closed by provider".to_string()),
            )
        };

        let Some(intent) = self
            .machine
            .ledger()
            .find_by_idempotency_key(&notification.out_batch_no)
            .await?
        else {
            warn!(
                out_batch_no = %notification.out_batch_no,
                event_id = ?envelope.id,
                "Reconciliation gap: webhook matches no payout intent"
            );
            return Ok(WebhookAck::Unmatched {
                out_batch_no: notification.out_batch_no,
            });
        };

        let intent_id = intent.id;
        let ack = self
            .apply(intent, notification, result, notification_id.clone())
            .await?;

        // Applied notifications were recorded with their transition.
        if let Some(id) = &notification_id {
            if !matches!(ack, WebhookAck::Applied { .. }) {
                self.machine
                    .ledger()
                    .record_notification(id, intent_id, self.machine.clock().now())
                    .await?;
            }
        }
        Ok(ack)
    }

    async fn apply(
        &self,
        intent: PayoutIntent,
        notification: TransferNotification,
        result: TransferResult,
        notification_id: Option<String>,
    ) -> Result<WebhookAck, WebhookError> {
        match intent.status {
            status if status.is_terminal() => {
                info!(intent_id = %intent.id, status = %status, "Webhook for settled payout, no-op");
                return Ok(WebhookAck::AlreadySettled {
                    intent_id: intent.id,
                    status,
                });
            }
            PayoutStatus::Submitted => {}
            status => {
                warn!(
                    intent_id = %intent.id,
                    status = %status,
                    "Webhook for payout not awaiting a provider result"
                );
                return Ok(WebhookAck::Deferred {
                    intent_id: intent.id,
                    status,
                });
            }
        }

        let updated = match result {
            TransferResult::Succeeded => {
                self.machine
                    .complete_notified(
                        &intent,
                        notification.batch_id,
                        AuditAction::WebhookSucceeded,
                        AuditActor::Provider,
                        "provider confirmed transfer".to_string(),
                        notification_id,
                    )
                    .await?
            }
            TransferResult::Closed(reason) => {
                if let (Some(batch_id), Some(current)) =
                    (&notification.batch_id, &intent.provider_reference)
                {
                    if batch_id != current {
                        warn!(
                            intent_id = %intent.id,
                            batch_id = %batch_id,
                            current = %current,
                            "Closure reported for a superseded provider batch"
                        );
                        return Ok(WebhookAck::StaleBatch {
                            intent_id: intent.id,
                            batch_id: batch_id.clone(),
                        });
                    }
                }
                self.machine
                    .fail_with_cap_notified(
                        &intent,
                        AuditAction::WebhookFailed,
                        AuditActor::Provider,
                        format!("provider closed transfer: {}", reason),
                        notification_id,
                    )
                    .await?
            }
        };

        match updated {
            Some(updated) => Ok(WebhookAck::Applied {
                intent_id: updated.id,
                status: updated.status,
            }),
            None => {
                // Lost the race against the worker or another delivery.
                let current = self
                    .machine
                    .ledger()
                    .get(intent.id)
                    .await?
                    .map(|i| i.status)
                    .unwrap_or(intent.status);
                Ok(if current.is_terminal() {
                    WebhookAck::AlreadySettled {
                        intent_id: intent.id,
                        status: current,
                    }
                } else {
                    WebhookAck::Deferred {
                        intent_id: intent.id,
                        status: current,
                    }
                })
            }
        }
    }
}
