//! In-process priority queue for development mode and tests.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::Mutex;

use super::{JobQueue, PayoutJob, QueueError};

struct QueuedJob {
    seq: u64,
    job: PayoutJob,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // Max-heap: higher priority first, then lower sequence number first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<QueuedJob>,
    next_seq: u64,
}

#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: PayoutJob) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueuedJob { seq, job });
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<PayoutJob>, QueueError> {
        Ok(self.inner.lock().await.heap.pop().map(|queued| queued.job))
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.inner.lock().await.heap.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payouts::models::PayoutId;
    use crate::queue::JobPriority;
    use chrono::Utc;

    #[tokio::test]
    async fn dequeues_by_priority_then_fifo() {
        let queue = MemoryQueue::new();
        let low_first = PayoutJob::new(PayoutId::new(), JobPriority::NORMAL, 1, Utc::now());
        let low_second = PayoutJob::new(PayoutId::new(), JobPriority::NORMAL, 1, Utc::now());
        let manual = PayoutJob::new(PayoutId::new(), JobPriority::MANUAL, 1, Utc::now());
        let high = PayoutJob::new(PayoutId::new(), JobPriority::HIGH, 1, Utc::now());

        for job in [&low_first, &low_second, &manual, &high] {
            queue.enqueue(job.clone()).await.unwrap();
        }
        assert_eq!(queue.depth().await.unwrap(), 4);

        let order: Vec<_> = [
            queue.dequeue().await.unwrap().unwrap(),
            queue.dequeue().await.unwrap().unwrap(),
            queue.dequeue().await.unwrap().unwrap(),
            queue.dequeue().await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|j| j.job_id)
        .collect();

        assert_eq!(
            order,
            vec![manual.job_id, high.job_id, low_first.job_id, low_second.job_id]
        );
        assert!(queue.dequeue().await.unwrap().is_none());
    }
}
