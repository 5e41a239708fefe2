//! Worker pool & dispatcher (§4.7)
//!
//! The dispatcher pulls batches off the queue backend and hands each job to
//! the least-busy worker (ties broken by lowest index); every worker
//! processes its assigned jobs strictly sequentially, so total in-flight
//! concurrency is bounded by the worker count. Shutdown runs in five
//! phases: stop pulling new jobs, wait up to `shutdown_grace_secs` for
//! in-flight work to finish, nack anything still running with zero delay,
//! stop plugins in reverse start order, then return once every worker task
//! has exited.
use crate::config::Config;
use crate::error::Result;
use crate::metrics;
use crate::plugin::PluginRegistry;
use crate::queue::QueueBackend;
use crate::runner::JobRunner;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

struct WorkerSlot {
    // `None` once shutdown has dropped every sender, so the worker's
    // `rx.recv()` observes the channel closing and the task exits.
    tx: Mutex<Option<mpsc::Sender<crate::job::Job>>>,
    pending: Arc<AtomicUsize>,
    current_job_id: Arc<Mutex<Option<String>>>,
}

/// Runs a fixed-size pool of sequential workers pulling from a shared queue.
pub struct WorkerPool {
    queue: Arc<dyn QueueBackend>,
    _runner: Arc<JobRunner>,
    workers: Vec<WorkerSlot>,
    batch_size: usize,
    shutdown_grace: Duration,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: &Config, runner: Arc<JobRunner>, queue: Arc<dyn QueueBackend>) -> Self {
        let mut workers = Vec::with_capacity(config.max_workers);
        let mut handles = Vec::with_capacity(config.max_workers);

        for index in 0..config.max_workers {
            let (tx, rx) = mpsc::channel(1);
            let pending = Arc::new(AtomicUsize::new(0));
            let current_job_id = Arc::new(Mutex::new(None));
            handles.push(Self::spawn_worker(index, rx, Arc::clone(&runner), Arc::clone(&pending), Arc::clone(&current_job_id)));
            workers.push(WorkerSlot { tx: Mutex::new(Some(tx)), pending, current_job_id });
        }

        metrics::set_worker_count(config.max_workers);
        Self {
            queue,
            _runner: runner,
            workers,
            batch_size: config.batch_size.max(1),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
            worker_handles: Mutex::new(handles),
        }
    }

    fn spawn_worker(
        index: usize,
        mut rx: mpsc::Receiver<crate::job::Job>,
        runner: Arc<JobRunner>,
        pending: Arc<AtomicUsize>,
        current_job_id: Arc<Mutex<Option<String>>>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                *current_job_id.lock().unwrap() = Some(job.id.clone());
                if let Err(e) = runner.run_attempt(job).await {
                    warn!("Worker {} failed to execute job: {}", index, e);
                }
                *current_job_id.lock().unwrap() = None;
                pending.fetch_sub(1, Ordering::SeqCst);
            }
            debug!("Worker {} shut down", index);
        })
    }

    /// The index of the worker with the fewest pending+running jobs,
    /// ties broken by lowest index.
    fn least_busy_worker(&self) -> usize {
        self.workers
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.pending.load(Ordering::SeqCst))
            .map(|(i, _)| i)
            .expect("worker pool is never empty")
    }

    async fn dispatch(&self, job: crate::job::Job) {
        let index = self.least_busy_worker();
        let worker = &self.workers[index];
        let tx = worker.tx.lock().unwrap().clone();
        match tx {
            Some(tx) => {
                worker.pending.fetch_add(1, Ordering::SeqCst);
                if tx.send(job).await.is_err() {
                    worker.pending.fetch_sub(1, Ordering::SeqCst);
                    warn!("Worker {} channel closed, job dropped back to backend-unacked state", index);
                }
            }
            None => warn!("Worker {} already shut down, job dropped back to backend-unacked state", index),
        }
    }

    /// Runs the dispatch loop until `shutdown_rx` observes `true`, then
    /// performs the five-phase shutdown before returning.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>, plugins: &mut PluginRegistry) -> Result<()> {
        info!("Worker pool starting with {} workers", self.workers.len());
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                jobs = self.queue.pop_batch(self.batch_size) => {
                    let jobs = jobs?;
                    if jobs.is_empty() {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                    for job in jobs {
                        self.dispatch(job).await;
                    }
                }
            }
            if let Ok(size) = self.queue.qsize().await {
                metrics::set_queue_size(size);
            }
            metrics::set_inflight_jobs(self.inflight_count());
        }

        info!("Shutdown requested, no longer pulling new jobs");
        self.graceful_shutdown(plugins).await;
        Ok(())
    }

    fn inflight_count(&self) -> usize {
        self.workers.iter().map(|w| w.pending.load(Ordering::SeqCst)).sum()
    }

    async fn graceful_shutdown(&self, plugins: &mut PluginRegistry) {
        // Phase 2: wait for in-flight work to drain, up to the grace period.
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        while self.inflight_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Phase 3: anything still running gets nacked with zero delay so it
        // becomes immediately visible again for the next process to pick up.
        for worker in &self.workers {
            if let Some(id) = worker.current_job_id.lock().unwrap().clone() {
                warn!("Job \"{}\" still running past shutdown grace period, nacking", id);
                if let Err(e) = self.queue.nack(&id, Duration::ZERO).await {
                    warn!("Failed to nack job \"{}\" during shutdown: {}", id, e);
                }
            }
        }

        // Phase 4: stop plugins in reverse start order.
        plugins.stop_all();

        // Phase 5: close worker channels and wait for their tasks to exit.
        drop_senders(&self.workers);
        let handles = std::mem::take(&mut *self.worker_handles.lock().unwrap());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker task join failed during shutdown: {}", e);
            }
        }
        info!("Worker pool shut down cleanly");
    }

    /// Plain, exporter-independent pull snapshot (§4.8).
    pub async fn metrics_snapshot(&self) -> crate::metrics::MetricsSnapshot {
        let queue_size = self.queue.qsize().await.unwrap_or(0);
        crate::metrics::MetricsSnapshot {
            queue_size,
            inflight_jobs: self.inflight_count(),
            worker_count: self.workers.len(),
        }
    }
}

fn drop_senders(workers: &[WorkerSlot]) {
    for worker in workers {
        worker.tx.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobOptions, JobStatus};
    use crate::queue::MemoryQueue;
    use crate::result::MemoryResultBackend;
    use crate::task::{RegisterMode, TaskDefinition, TaskHooks, TaskRegistry};

    fn test_config(max_workers: usize) -> Config {
        Config {
            max_workers,
            batch_size: 2,
            shutdown_grace_secs: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn least_busy_worker_picks_lowest_index_on_tie() {
        let tasks = Arc::new(TaskRegistry::new());
        let queue: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::default());
        let results = Arc::new(MemoryResultBackend::new());
        let runner = Arc::new(JobRunner::new(tasks, Arc::clone(&queue), results));
        let pool = WorkerPool::new(&test_config(3), runner, queue);
        assert_eq!(pool.least_busy_worker(), 0);
    }

    #[tokio::test]
    async fn pool_executes_dispatched_jobs() {
        let tasks = TaskRegistry::new();
        tasks
            .register(
                TaskDefinition {
                    name: "noop".to_string(),
                    callable: Arc::new(|_a, _k| Ok(serde_json::Value::Null)),
                    retries: 0,
                    retry_delay_secs: 0,
                    timeout_secs: None,
                    timeout_policy: crate::job::TimeoutPolicy::Fail,
                    store_result: true,
                    hooks: TaskHooks::default(),
                    tags: vec![],
                    description: None,
                },
                RegisterMode::Strict,
            )
            .unwrap();
        let tasks = Arc::new(tasks);
        let queue: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::default());
        let results = Arc::new(MemoryResultBackend::new());
        let runner = Arc::new(JobRunner::new(tasks, Arc::clone(&queue), Arc::clone(&results)));
        let pool = WorkerPool::new(&test_config(2), runner, Arc::clone(&queue));

        let job = Job::new("noop", vec![], serde_json::Map::new(), JobOptions::default());
        let id = job.id.clone();
        queue.enqueue(job).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut plugins = PluginRegistry::load(std::path::Path::new("/nonexistent")).unwrap();
        let run_fut = pool.run(shutdown_rx, &mut plugins);
        tokio::pin!(run_fut);
        tokio::select! {
            _ = &mut run_fut => {}
            _ = tokio::time::sleep(Duration::from_millis(300)) => {
                shutdown_tx.send(true).unwrap();
                run_fut.await.unwrap();
            }
        }

        let record = results.get_full(&id).await.unwrap();
        assert_eq!(record.map(|r| r.status), Some(JobStatus::Success));
    }
}
