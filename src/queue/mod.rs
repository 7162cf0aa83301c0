//! Payout job queue
//!
//! Jobs only reference an intent by id; the ledger stays the source of truth
//! and a job whose intent has moved on is a no-op at pickup. Duplicate jobs
//! for the same intent are therefore harmless.

pub mod memory;
#[cfg(feature = "cache")]
pub mod redis;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payouts::models::PayoutId;

pub use memory::MemoryQueue;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[cfg(feature = "cache")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("queue pool error: {0}")]
    Pool(String),

    #[error("job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Dispatch priority. Higher is dispatched first; it is a tie-break only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPriority(pub u8);

impl JobPriority {
    pub const NORMAL: JobPriority = JobPriority(0);
    /// High-value payouts and automatic retries.
    pub const HIGH: JobPriority = JobPriority(1);
    /// Operator-triggered retries.
    pub const MANUAL: JobPriority = JobPriority(2);
    pub const MAX: JobPriority = JobPriority::MANUAL;

    /// Priority of a first attempt.
    pub fn for_amount(amount: &BigDecimal, high_value_threshold: &BigDecimal) -> Self {
        if amount >= high_value_threshold {
            JobPriority::HIGH
        } else {
            JobPriority::NORMAL
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutJob {
    pub job_id: Uuid,
    pub intent_id: PayoutId,
    pub priority: JobPriority,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl PayoutJob {
    pub fn new(
        intent_id: PayoutId,
        priority: JobPriority,
        attempt: u32,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            intent_id,
            priority,
            attempt,
            enqueued_at,
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: PayoutJob) -> Result<(), QueueError>;

    /// Claim the highest-priority job, oldest first within a priority.
    /// A claimed job is removed; `None` when the queue is empty.
    async fn dequeue(&self) -> Result<Option<PayoutJob>, QueueError>;

    async fn depth(&self) -> Result<u64, QueueError>;
}
