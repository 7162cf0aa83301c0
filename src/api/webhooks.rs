//! Provider webhook endpoint
//!
//! Success is returned for matched, duplicate and unmatched deliveries so the
//! provider stops re-sending them. Only authentication or payload failures
//! (and storage errors, which the provider should retry) get a non-success
//! response.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use tracing::{error, info};

use super::AppState;
use crate::error::WebhookError;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WebhookResponse {
    fn success() -> Self {
        Self {
            code: "SUCCESS",
            message: None,
        }
    }

    fn fail(message: String) -> Self {
        Self {
            code: "FAIL",
            message: Some(message),
        }
    }
}

/// POST /api/payouts/webhooks/provider
pub async fn provider_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    match state.reconciler.handle(&headers, &body).await {
        Ok(ack) => {
            info!(ack = ?ack, "Provider webhook acknowledged");
            (StatusCode::OK, Json(WebhookResponse::success()))
        }
        Err(err) => {
            let status = err.status_code();
            let message = match &err {
                WebhookError::Ledger(e) => {
                    error!(error = %e, "Provider webhook failed on storage");
                    "internal error".to_string()
                }
                other => other.to_string(),
            };
            (status, Json(WebhookResponse::fail(message)))
        }
    }
}
