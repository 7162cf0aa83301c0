//! Payout API endpoints
//!
//! Inbound interface for the lottery feature (initiate, status, records)
//! plus the operator and dashboard endpoints (manual retry, audit trail,
//! stats).

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::AppState;
use crate::error::PayoutError;
use crate::payouts::models::{PayoutAuditEntry, PayoutId, PayoutStatus};
use crate::services::payout_initiator::DEFAULT_PAGE_SIZE;
use crate::services::{InitiatePayout, PayoutRecords, PayoutStats, PayoutStatusView};

const OPERATOR_HEADER: &str = "x-operator";

#[derive(Debug, Serialize)]
pub struct InitiatePayoutResponse {
    pub intent_id: PayoutId,
    pub status: PayoutStatus,
}

#[derive(Debug, Serialize)]
pub struct RetryPayoutResponse {
    pub intent_id: PayoutId,
    pub status: PayoutStatus,
    pub attempt_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    pub status: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

fn parse_intent_id(raw: &str) -> Result<PayoutId, PayoutError> {
    raw.parse()
        .map_err(|_| PayoutError::NotFound(format!("payout intent {}", raw)))
}

/// POST /api/payouts
pub async fn initiate_payout(
    State(state): State<AppState>,
    Json(request): Json<InitiatePayout>,
) -> Result<impl IntoResponse, PayoutError> {
    info!(
        source_event_id = %request.source_event_id,
        amount = %request.amount,
        "Payout initiation requested"
    );

    let intent = state.initiator.initiate(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(InitiatePayoutResponse {
            intent_id: intent.id,
            status: intent.status,
        }),
    ))
}

/// GET /api/payouts/source/{source_event_id}
pub async fn get_payout_status(
    State(state): State<AppState>,
    Path(source_event_id): Path<String>,
) -> Result<Json<PayoutStatusView>, PayoutError> {
    Ok(Json(state.initiator.get_status(&source_event_id).await?))
}

/// GET /api/payouts/beneficiary/{beneficiary_id}?status=&page=&limit=
pub async fn list_beneficiary_payouts(
    State(state): State<AppState>,
    Path(beneficiary_id): Path<String>,
    Query(query): Query<RecordsQuery>,
) -> Result<Json<PayoutRecords>, PayoutError> {
    let status = match query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            PayoutStatus::parse(&raw.to_ascii_uppercase())
                .ok_or_else(|| PayoutError::Validation(format!("unknown status {}", raw)))?,
        ),
        None => None,
    };

    let records = state
        .initiator
        .list(
            &beneficiary_id,
            status,
            query.page.unwrap_or(1),
            query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;
    Ok(Json(records))
}

/// POST /api/payouts/{id}/retry
pub async fn retry_payout(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, PayoutError> {
    let intent_id = parse_intent_id(&id)?;
    let operator = headers
        .get(OPERATOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PayoutError::Validation(format!("{} header is required", OPERATOR_HEADER)))?;

    let intent = state.initiator.retry(intent_id, operator).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RetryPayoutResponse {
            intent_id: intent.id,
            status: intent.status,
            attempt_count: intent.attempt_count,
        }),
    ))
}

/// GET /api/payouts/{id}/audit
pub async fn get_audit_trail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<PayoutAuditEntry>>, PayoutError> {
    let intent_id = parse_intent_id(&id)?;
    Ok(Json(state.initiator.audit_trail(intent_id).await?))
}

/// GET /api/payouts/stats?from=&to=
///
/// Defaults to the last 24 hours.
pub async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<PayoutStats>, PayoutError> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - Duration::hours(24));
    Ok(Json(state.initiator.stats(from, to).await?))
}
