//! Redis-backed persistent queue
//!
//! Jobs live in one sorted set. The score orders by priority class, then by
//! enqueue time, and `ZPOPMIN` claims a job atomically so concurrent
//! consumers on different processes never receive the same entry.

use async_trait::async_trait;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use tracing::info;

use super::{JobPriority, JobQueue, PayoutJob, QueueError};

const PRIORITY_BAND: f64 = 1e13;

pub struct RedisQueue {
    pool: Pool<RedisConnectionManager>,
    key: String,
}

impl RedisQueue {
    pub async fn connect(redis_url: &str, key: impl Into<String>) -> Result<Self, QueueError> {
        let manager = RedisConnectionManager::new(redis_url)?;
        let pool = Pool::builder().max_size(8).build(manager).await?;
        let key = key.into();
        info!(queue_key = %key, "Redis payout queue connected");
        Ok(Self { pool, key })
    }

    async fn connection(
        &self,
    ) -> Result<bb8::PooledConnection<'_, RedisConnectionManager>, QueueError> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::Pool(e.to_string()))
    }
}

/// Lower score pops first.
pub(crate) fn score(job: &PayoutJob) -> f64 {
    let band = f64::from(JobPriority::MAX.0.saturating_sub(job.priority.0));
    band * PRIORITY_BAND + job.enqueued_at.timestamp_millis() as f64
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: PayoutJob) -> Result<(), QueueError> {
        let member = serde_json::to_string(&job)?;
        let mut conn = self.connection().await?;
        redis::cmd("ZADD")
            .arg(&self.key)
            .arg(score(&job))
            .arg(member)
            .query_async::<()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<PayoutJob>, QueueError> {
        let mut conn = self.connection().await?;
        let popped: Vec<String> = redis::cmd("ZPOPMIN")
            .arg(&self.key)
            .arg(1)
            .query_async(&mut *conn)
            .await?;

        match popped.first() {
            Some(member) => Ok(Some(serde_json::from_str(member)?)),
            None => Ok(None),
        }
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = redis::cmd("ZCARD")
            .arg(&self.key)
            .query_async(&mut *conn)
            .await?;
        Ok(depth)
    }
}
