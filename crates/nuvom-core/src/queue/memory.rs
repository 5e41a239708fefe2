//! In-memory queue backend
//!
//! A bounded FIFO guarded by a mutex and a [`Notify`], intended for tests
//! and single-process ephemeral use. No persistence; `ack`/`nack` are
//! no-ops since there is no lease to honor.
use super::QueueBackend;
use crate::error::Result;
use crate::job::Job;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
#[allow(unused_imports)]
use tracing::debug;

pub struct MemoryQueue {
    capacity: usize,
    jobs: Mutex<VecDeque<Job>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            jobs: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(&self, mut job: Job) -> Result<()> {
        job.mark_enqueued();
        {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.len() >= self.capacity {
                return Err(crate::error::NuvomError::BackendUnavailable(
                    "in-memory queue is full".to_string(),
                ));
            }
            jobs.push_back(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>> {
        if let Some(job) = self.jobs.lock().unwrap().pop_front() {
            return Ok(Some(job));
        }
        tokio::select! {
            _ = self.notify.notified() => Ok(self.jobs.lock().unwrap().pop_front()),
            _ = tokio::time::sleep(timeout) => Ok(None),
        }
    }

    async fn pop_batch(&self, n: usize) -> Result<Vec<Job>> {
        let mut jobs = self.jobs.lock().unwrap();
        let n = n.min(jobs.len());
        Ok(jobs.drain(..n).collect())
    }

    async fn qsize(&self) -> Result<usize> {
        Ok(self.jobs.lock().unwrap().len())
    }

    async fn clear(&self) -> Result<()> {
        self.jobs.lock().unwrap().clear();
        Ok(())
    }

    async fn ack(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _id: &str, _requeue_delay: Duration) -> Result<()> {
        Ok(())
    }
}
