//! Business-layer errors and their HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::payouts::ledger::LedgerError;
use crate::payouts::models::PayoutId;
use crate::providers::ProviderError;
use crate::queue::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidAmount,
    DuplicateSourceEvent,
    NotFound,
    RetryRejected,
    InvalidRequest,
    InternalError,
}

/// Error envelope: `{ "error": { "code", "message" } }`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<PayoutId>,
}

// ============================================================================
// Payout Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PayoutError {
    /// Amount outside provider bounds or not in minor-unit precision. When the
    /// intent was already recorded, it has been moved to `FAILED`.
    #[error("invalid amount {amount}: {reason}")]
    InvalidAmount {
        amount: String,
        reason: String,
        intent_id: Option<PayoutId>,
    },

    #[error("payout already exists for source event {source_event_id}")]
    DuplicateSourceEvent {
        source_event_id: String,
        intent_id: Option<PayoutId>,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("retry rejected for {intent_id}: {reason}")]
    RetryRejected { intent_id: PayoutId, reason: String },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl PayoutError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            PayoutError::InvalidAmount { .. } => ErrorCode::InvalidAmount,
            PayoutError::DuplicateSourceEvent { .. } => ErrorCode::DuplicateSourceEvent,
            PayoutError::NotFound(_) => ErrorCode::NotFound,
            PayoutError::RetryRejected { .. } => ErrorCode::RetryRejected,
            PayoutError::Validation(_) => ErrorCode::InvalidRequest,
            PayoutError::Ledger(_) | PayoutError::Queue(_) => ErrorCode::InternalError,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PayoutError::InvalidAmount { .. } | PayoutError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            PayoutError::DuplicateSourceEvent { .. } | PayoutError::RetryRejected { .. } => {
                StatusCode::CONFLICT
            }
            PayoutError::NotFound(_) => StatusCode::NOT_FOUND,
            PayoutError::Ledger(_) | PayoutError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn intent_id(&self) -> Option<PayoutId> {
        match self {
            PayoutError::InvalidAmount { intent_id, .. }
            | PayoutError::DuplicateSourceEvent { intent_id, .. } => *intent_id,
            PayoutError::RetryRejected { intent_id, .. } => Some(*intent_id),
            _ => None,
        }
    }

    /// Message safe to show to API callers.
    pub fn user_message(&self) -> String {
        match self {
            PayoutError::Ledger(_) | PayoutError::Queue(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for PayoutError {
    fn into_response(self) -> Response {
        if matches!(self, PayoutError::Ledger(_) | PayoutError::Queue(_)) {
            tracing::error!(error = %self, "Payout request failed");
        }
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code(),
                message: self.user_message(),
                intent_id: self.intent_id(),
            },
        };
        (self.status_code(), Json(body)).into_response()
    }
}

// ============================================================================
// Webhook Errors
// ============================================================================

/// Reasons a webhook delivery is refused. Anything else is acknowledged.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook signature verification failed")]
    InvalidSignature,

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("webhook decryption failed: {0}")]
    Decryption(#[source] ProviderError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl WebhookError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::MalformedPayload(_) | WebhookError::Decryption(_) => {
                StatusCode::BAD_REQUEST
            }
            WebhookError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
