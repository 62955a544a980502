//! FIFO queue of job ids awaiting orchestrator attention.
//!
//! The queue holds only ids; the full job is re-read from the store on
//! dequeue so the driver always starts from the latest persisted state.
//! Each enqueued id is handed to exactly one dequeuer.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::{constants::MAX_QUEUE_SIZE, ConductorError, Result};

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Mutex<VecDeque<String>>>,
    notify: Arc<Notify>,
    max_size: usize,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(MAX_QUEUE_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            max_size,
        }
    }

    /// Append a job id to the tail.
    pub async fn enqueue(&self, job_id: impl Into<String>) -> Result<()> {
        let job_id = job_id.into();
        {
            let mut queue = self.inner.lock().await;
            if queue.len() >= self.max_size {
                return Err(ConductorError::QueueFull);
            }
            queue.push_back(job_id.clone());
            debug!("Job {} enqueued (depth: {})", job_id, queue.len());
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the head, or None when empty. The pop happens under the queue
    /// lock, so no two callers ever receive the same id for one enqueue.
    pub async fn dequeue(&self) -> Option<String> {
        let mut queue = self.inner.lock().await;
        let job_id = queue.pop_front();
        if let Some(ref id) = job_id {
            debug!("Job {} dequeued (remaining: {})", id, queue.len());
        }
        job_id
    }

    /// Wait until an id is available, then pop it.
    pub async fn dequeue_wait(&self) -> String {
        loop {
            if let Some(id) = self.dequeue().await {
                return id;
            }
            self.notify.notified().await;
        }
    }

    /// Append to the tail again, after a retry or renewed readiness.
    pub async fn requeue(&self, job_id: impl Into<String>) -> Result<()> {
        self.enqueue(job_id).await
    }

    /// Requeue after a delay without blocking the caller. Used for
    /// back-off when no agent matched a ready task.
    pub fn requeue_after(&self, job_id: String, delay: std::time::Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.requeue(job_id.clone()).await {
                tracing::warn!("Delayed requeue of job {} failed: {}", job_id, e);
            }
        });
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = JobQueue::new();
        queue.enqueue("a").await.unwrap();
        queue.enqueue("b").await.unwrap();
        queue.enqueue("c").await.unwrap();

        assert_eq!(queue.dequeue().await.as_deref(), Some("a"));
        assert_eq!(queue.dequeue().await.as_deref(), Some("b"));
        assert_eq!(queue.dequeue().await.as_deref(), Some("c"));
        assert_eq!(queue.dequeue().await, None);
    }

    #[tokio::test]
    async fn bounded_queue_rejects_overflow() {
        let queue = JobQueue::with_capacity(1);
        queue.enqueue("a").await.unwrap();
        assert!(matches!(
            queue.enqueue("b").await,
            Err(ConductorError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn each_id_is_delivered_at_most_once() {
        let queue = JobQueue::new();
        for i in 0..100 {
            assert_ok!(queue.enqueue(format!("job-{i}")).await);
        }

        let consumers = (0..4).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(id) = queue.dequeue().await {
                    seen.push(id);
                }
                seen
            })
        });

        let all: Vec<String> = futures::future::join_all(consumers)
            .await
            .into_iter()
            .flat_map(|result| result.unwrap())
            .collect();
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 100);
        assert_eq!(unique.len(), 100);
    }

    #[tokio::test]
    async fn dequeue_wait_wakes_on_enqueue() {
        let queue = JobQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue_wait().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.enqueue("late").await.unwrap();

        let id = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "late");
    }

    #[tokio::test]
    async fn requeue_after_delivers_later() {
        let queue = JobQueue::new();
        queue.requeue_after("delayed".to_string(), std::time::Duration::from_millis(10));
        assert_eq!(queue.dequeue().await, None);

        let id = tokio::time::timeout(std::time::Duration::from_secs(1), queue.dequeue_wait())
            .await
            .unwrap();
        assert_eq!(id, "delayed");
    }
}
