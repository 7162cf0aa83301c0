//! PostgreSQL ledger
//!
//! Status changes are single-row `UPDATE ... WHERE id = $1 AND status = $2`
//! statements; the audit row is inserted in the same database transaction so
//! a won CAS always leaves exactly one audit entry behind.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::ledger::{LedgerError, PayoutLedger};
use super::models::{
    AuditAction, AuditActor, IntentPage, PayoutAuditEntry, PayoutId, PayoutIntent, PayoutStatus,
    StatusCount, TransitionRequest,
};

const INTENT_COLUMNS: &str = r#"
    id, beneficiary_id, source_event_id, amount, memo, idempotency_key,
    provider_reference, status, attempt_count, max_attempts, next_retry_at,
    failure_reason, next_check_at, check_count, created_at, updated_at, completed_at
"#;

/// Establish a connection pool and apply pending migrations.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, LedgerError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| LedgerError::Database(e.into()))?;
    info!("Payout ledger migrations applied");
    Ok(pool)
}

#[derive(Debug, sqlx::FromRow)]
struct IntentRow {
    id: Uuid,
    beneficiary_id: String,
    source_event_id: String,
    amount: BigDecimal,
    memo: Option<String>,
    idempotency_key: String,
    provider_reference: Option<String>,
    status: String,
    attempt_count: i32,
    max_attempts: i32,
    next_retry_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    next_check_at: Option<DateTime<Utc>>,
    check_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<IntentRow> for PayoutIntent {
    type Error = LedgerError;

    fn try_from(row: IntentRow) -> Result<Self, Self::Error> {
        let status = PayoutStatus::parse(&row.status)
            .ok_or_else(|| LedgerError::Corrupt(format!("invalid status: {}", row.status)))?;

        Ok(PayoutIntent {
            id: PayoutId::from_uuid(row.id),
            beneficiary_id: row.beneficiary_id,
            source_event_id: row.source_event_id,
            amount: row.amount,
            memo: row.memo,
            idempotency_key: row.idempotency_key,
            provider_reference: row.provider_reference,
            status,
            attempt_count: u32::try_from(row.attempt_count)
                .map_err(|_| LedgerError::Corrupt(format!("attempt_count {}", row.attempt_count)))?,
            max_attempts: u32::try_from(row.max_attempts)
                .map_err(|_| LedgerError::Corrupt(format!("max_attempts {}", row.max_attempts)))?,
            next_retry_at: row.next_retry_at,
            failure_reason: row.failure_reason,
            next_check_at: row.next_check_at,
            check_count: u32::try_from(row.check_count)
                .map_err(|_| LedgerError::Corrupt(format!("check_count {}", row.check_count)))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    intent_id: Uuid,
    action: String,
    status_before: Option<String>,
    status_after: String,
    message: String,
    actor: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for PayoutAuditEntry {
    type Error = LedgerError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let parse_status = |s: &str| {
            PayoutStatus::parse(s).ok_or_else(|| LedgerError::Corrupt(format!("invalid status: {}", s)))
        };

        Ok(PayoutAuditEntry {
            intent_id: PayoutId::from_uuid(row.intent_id),
            action: AuditAction::parse(&row.action)
                .ok_or_else(|| LedgerError::Corrupt(format!("invalid action: {}", row.action)))?,
            status_before: row.status_before.as_deref().map(parse_status).transpose()?,
            status_after: parse_status(&row.status_after)?,
            message: row.message,
            actor: AuditActor::from(row.actor),
            timestamp: row.created_at,
        })
    }
}

pub struct PgPayoutLedger {
    pool: PgPool,
}

impl PgPayoutLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Option<PayoutIntent>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM payout_intents WHERE {} = $1",
            INTENT_COLUMNS, column
        );
        let row = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PayoutIntent::try_from).transpose()
    }
}

fn map_insert_error(err: sqlx::Error, intent: &PayoutIntent) -> LedgerError {
    if let sqlx::Error::Database(db) = &err {
        match db.constraint() {
            Some("uq_payout_intents_source_event") => {
                return LedgerError::Duplicate {
                    field: "source_event_id",
                    value: intent.source_event_id.clone(),
                }
            }
            Some("uq_payout_intents_idempotency_key") => {
                return LedgerError::Duplicate {
                    field: "idempotency_key",
                    value: intent.idempotency_key.clone(),
                }
            }
            _ => {}
        }
    }
    LedgerError::Database(err)
}

#[async_trait]
impl PayoutLedger for PgPayoutLedger {
    async fn insert(&self, intent: &PayoutIntent) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO payout_intents
                (id, beneficiary_id, source_event_id, amount, memo, idempotency_key,
                 status, attempt_count, max_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            "#,
        )
        .bind(intent.id.as_uuid())
        .bind(&intent.beneficiary_id)
        .bind(&intent.source_event_id)
        .bind(&intent.amount)
        .bind(&intent.memo)
        .bind(&intent.idempotency_key)
        .bind(intent.status.as_str())
        .bind(intent.attempt_count as i32)
        .bind(intent.max_attempts as i32)
        .bind(intent.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_insert_error(e, intent))?;

        sqlx::query(
            r#"
            INSERT INTO payout_audit_entries
                (intent_id, action, status_before, status_after, message, actor, created_at)
            VALUES ($1, $2, NULL, $3, $4, $5, $6)
            "#,
        )
        .bind(intent.id.as_uuid())
        .bind(AuditAction::Created.as_str())
        .bind(intent.status.as_str())
        .bind(format!("payout intent created for amount {}", intent.amount))
        .bind(AuditActor::System.as_string())
        .bind(intent.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: PayoutId) -> Result<Option<PayoutIntent>, LedgerError> {
        let sql = format!("SELECT {} FROM payout_intents WHERE id = $1", INTENT_COLUMNS);
        let row = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(PayoutIntent::try_from).transpose()
    }

    async fn find_by_source_event(
        &self,
        source_event_id: &str,
    ) -> Result<Option<PayoutIntent>, LedgerError> {
        self.fetch_one_where("source_event_id", source_event_id).await
    }

    async fn find_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<PayoutIntent>, LedgerError> {
        self.fetch_one_where("idempotency_key", idempotency_key).await
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

        let patch = request.patch;
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE payout_intents
            SET status = $1,
                updated_at = $2,
                provider_reference = COALESCE($3, provider_reference),
                failure_reason = CASE WHEN $4 THEN $5 ELSE failure_reason END,
                next_retry_at = CASE WHEN $6 THEN $7 ELSE next_retry_at END,
                completed_at = CASE WHEN $8 THEN $9 ELSE completed_at END,
                attempt_count = COALESCE($10, attempt_count),
                next_check_at = NULL,
                check_count = 0
            WHERE id = $11 AND status = $12
            RETURNING {}
            "#,
            INTENT_COLUMNS
        );

        let row = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(request.to.as_str())
            .bind(request.at)
            .bind(patch.provider_reference)
            .bind(patch.failure_reason.is_some())
            .bind(patch.failure_reason.flatten())
            .bind(patch.next_retry_at.is_some())
            .bind(patch.next_retry_at.flatten())
            .bind(patch.completed_at.is_some())
            .bind(patch.completed_at.flatten())
            .bind(patch.attempt_count.map(|n| n as i32))
            .bind(request.intent_id.as_uuid())
            .bind(request.from.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        if let Some(notification_id) = &request.notification_id {
            let recorded = sqlx::query(
                r#"
                INSERT INTO payout_webhook_events (notification_id, intent_id, received_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (notification_id) DO NOTHING
                "#,
            )
            .bind(notification_id)
            .bind(request.intent_id.as_uuid())
            .bind(request.at)
            .execute(&mut *tx)
            .await?;

            if recorded.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(None);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO payout_audit_entries
                (intent_id, action, status_before, status_after, message, actor, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(request.intent_id.as_uuid())
        .bind(request.action.as_str())
        .bind(request.from.as_str())
        .bind(request.to.as_str())
        .bind(&request.message)
        .bind(request.actor.as_string())
        .bind(request.at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        PayoutIntent::try_from(row).map(Some)
    }

    async fn record_provider_reference(
        &self,
        id: PayoutId,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE payout_intents
            SET provider_reference = $1, updated_at = $2
            WHERE id = $3 AND status = 'SUBMITTED' AND provider_reference IS NULL
            "#,
        )
        .bind(reference)
        .bind(at)
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn notification_seen(&self, notification_id: &str) -> Result<bool, LedgerError> {
        let seen: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM payout_webhook_events WHERE notification_id = $1",
        )
        .bind(notification_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(seen.is_some())
    }

    async fn record_notification(
        &self,
        notification_id: &str,
        intent_id: PayoutId,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO payout_webhook_events (notification_id, intent_id, received_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (notification_id) DO NOTHING
            "#,
        )
        .bind(notification_id)
        .bind(intent_id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn audit_trail(&self, id: PayoutId) -> Result<Vec<PayoutAuditEntry>, LedgerError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT intent_id, action, status_before, status_after, message, actor, created_at
            FROM   payout_audit_entries
            WHERE  intent_id = $1
            ORDER  BY id ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PayoutAuditEntry::try_from).collect()
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PayoutIntent>, LedgerError> {
        let sql = format!(
            r#"
            SELECT {} FROM payout_intents
            WHERE status = 'AWAITING_RETRY'
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
            ORDER BY next_retry_at ASC
            LIMIT $2
            "#,
            INTENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(PayoutIntent::try_from).collect()
    }

    async fn due_for_check(
        &self,
        status: PayoutStatus,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PayoutIntent>, LedgerError> {
        let sql = format!(
            r#"
            SELECT {} FROM payout_intents
            WHERE status = $1
              AND updated_at < $2
              AND (next_check_at IS NULL OR next_check_at <= $3)
            ORDER BY COALESCE(next_check_at, updated_at) ASC, created_at ASC
            LIMIT $4
            "#,
            INTENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(status.as_str())
            .bind(older_than)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(PayoutIntent::try_from).collect()
    }

    async fn schedule_check(
        &self,
        id: PayoutId,
        status: PayoutStatus,
        next_check_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE payout_intents
            SET next_check_at = $1, check_count = check_count + 1
            WHERE id = $2 AND status = $3
            "#,
        )
        .bind(next_check_at)
        .bind(id.as_uuid())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_by_beneficiary(
        &self,
        beneficiary_id: &str,
        status: Option<PayoutStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<IntentPage, LedgerError> {
        let status = status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)::BIGINT FROM payout_intents
            WHERE beneficiary_id = $1 AND ($2::VARCHAR IS NULL OR status = $2)
            "#,
        )
        .bind(beneficiary_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            r#"
            SELECT {} FROM payout_intents
            WHERE beneficiary_id = $1 AND ($2::VARCHAR IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
            INTENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(beneficiary_id)
            .bind(status)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(IntentPage {
            intents: rows
                .into_iter()
                .map(PayoutIntent::try_from)
                .collect::<Result<_, _>>()?,
            total: total.max(0) as u64,
        })
    }

    async fn count_by_status(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StatusCount>, LedgerError> {
        let rows: Vec<(String, i64, BigDecimal)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)::BIGINT, COALESCE(SUM(amount), 0)
            FROM   payout_intents
            WHERE  created_at >= $1 AND created_at < $2
            GROUP  BY status
            ORDER  BY status
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(status, count, total_amount)| {
                let status = PayoutStatus::parse(&status)
                    .ok_or_else(|| LedgerError::Corrupt(format!("invalid status: {}", status)))?;
                Ok(StatusCount {
                    status,
                    count: count.max(0) as u64,
                    total_amount,
                })
            })
            .collect()
    }
}
