//! HTTP surface of the payout pipeline

pub mod payouts;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::services::{PayoutInitiator, WebhookReconciler};

#[derive(Clone)]
pub struct AppState {
    pub initiator: Arc<PayoutInitiator>,
    pub reconciler: Arc<WebhookReconciler>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/payouts", post(payouts::initiate_payout))
        .route("/api/payouts/stats", get(payouts::get_stats))
        .route(
            "/api/payouts/source/{source_event_id}",
            get(payouts::get_payout_status),
        )
        .route(
            "/api/payouts/beneficiary/{beneficiary_id}",
            get(payouts::list_beneficiary_payouts),
        )
        .route("/api/payouts/{id}/retry", post(payouts::retry_payout))
        .route("/api/payouts/{id}/audit", get(payouts::get_audit_trail))
        .route(
            "/api/payouts/webhooks/provider",
            post(webhooks::provider_webhook),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
