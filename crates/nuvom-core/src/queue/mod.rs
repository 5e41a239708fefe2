//! Queue backend contract and built-in implementations
mod file;
mod memory;
mod sqlite;

pub use file::FileQueue;
pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;

use crate::error::Result;
use crate::job::Job;
use async_trait::async_trait;
use std::time::Duration;

/// A swappable implementation of job queueing.
///
/// Persistent backends additionally honor lease semantics: a successful
/// [`dequeue`](QueueBackend::dequeue)/[`pop_batch`](QueueBackend::pop_batch)
/// transfers a job into an in-flight set with a visibility timeout. If not
/// acknowledged within the timeout the job becomes visible again with
/// `retries_left` unchanged. Non-persistent backends (the in-memory queue)
/// treat [`ack`](QueueBackend::ack)/[`nack`](QueueBackend::nack) as no-ops.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Makes the job visible for dequeue. Callers must not re-submit; the
    /// backend is not required to deduplicate on `id`.
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Blocking wait up to `timeout` for a single job. Returns `None` on
    /// timeout or an empty queue.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>>;

    /// Non-blocking best-effort fetch of up to `n` jobs. Order is arrival
    /// order unless documented otherwise by the implementation; callers
    /// must treat order as a hint only.
    async fn pop_batch(&self, n: usize) -> Result<Vec<Job>>;

    /// Approximate pending count; may be eventually consistent.
    async fn qsize(&self) -> Result<usize>;

    /// Removes all pending jobs. Intended for tests.
    async fn clear(&self) -> Result<()>;

    /// Positive acknowledgment: the job reached a terminal outcome for
    /// this dequeue and should not reappear.
    async fn ack(&self, id: &str) -> Result<()>;

    /// Negative acknowledgment: the job should become visible again after
    /// `requeue_delay`, with `retries_left` left untouched by the backend
    /// itself (the caller is responsible for decrementing it beforehand).
    async fn nack(&self, id: &str, requeue_delay: Duration) -> Result<()>;
}
