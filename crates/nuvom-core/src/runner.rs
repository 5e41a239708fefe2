//! Job runner: executes one attempt of a job against its task definition
//!
//! Implements the six-step execution sequence: resolve the task, mark the
//! job running, invoke the `before` hook, run the callable under the
//! configured timeout, invoke `after`/`on_error`, then persist the outcome
//! and ack/nack the queue lease. Hook errors are logged, never propagated.
use crate::error::{NuvomError, Result};
use crate::job::{Attempt, AttemptOutcome, Job, JobStatus, TimeoutPolicy};
use crate::metrics;
use crate::queue::QueueBackend;
use crate::result::ResultBackend;
use crate::task::TaskRegistry;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Bounded retry policy applied to transient `BackendUnavailable` errors
/// from a queue/result backend, independent of the job's own retry budget.
const BACKEND_RETRY_ATTEMPTS: u32 = 3;
const BACKEND_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

async fn with_backend_retry<T, F, Fut>(op_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = BACKEND_RETRY_BASE_DELAY;
    for attempt in 1..=BACKEND_RETRY_ATTEMPTS {
        match f().await {
            Ok(value) => return Ok(value),
            Err(NuvomError::BackendUnavailable(msg)) if attempt < BACKEND_RETRY_ATTEMPTS => {
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    op_name, attempt, BACKEND_RETRY_ATTEMPTS, msg, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop always returns on its final attempt")
}

/// Runs jobs against the task registry, persisting outcomes and acking the
/// queue lease. One `JobRunner` is shared (via `Arc`) across every worker.
pub struct JobRunner {
    tasks: Arc<TaskRegistry>,
    queue: Arc<dyn QueueBackend>,
    results: Arc<dyn ResultBackend>,
}

impl JobRunner {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        queue: Arc<dyn QueueBackend>,
        results: Arc<dyn ResultBackend>,
    ) -> Self {
        Self { tasks, queue, results }
    }

    /// Executes a single attempt of `job` end to end. Never returns an
    /// error for task-level failures (those are terminal outcomes recorded
    /// in the result backend); only unrecoverable backend errors surface.
    #[tracing::instrument(skip_all, fields(job_id = %job.id, func = %job.func_name))]
    pub async fn run_attempt(&self, mut job: Job) -> Result<()> {
        let task = match self.tasks.get(&job.func_name) {
            Ok(task) => task,
            Err(e) => {
                warn!("Job \"{}\" references unknown task: {}", job.id, e);
                self.finish_failed(&mut job, JobStatus::Failed, &e.to_string(), None)
                    .await?;
                return Ok(());
            }
        };

        job.status = JobStatus::Running;
        job.started_at = Some(SystemTime::now());
        if let Some(before) = &task.hooks.before {
            let before = Arc::clone(before);
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| before())) {
                warn!("before hook panicked for job \"{}\": {:?}", job.id, e);
            }
        }

        let started = Instant::now();
        let callable = Arc::clone(&task.callable);
        let args = job.args.clone();
        let kwargs = job.kwargs.clone();
        let outcome = tokio::task::spawn_blocking(move || callable(args, kwargs));

        // Flattened to `Result<Value, String>`: a panic is just another
        // kind of task failure as far as retry/terminal handling cares.
        let attempt_result: std::result::Result<serde_json::Value, String> = match job.timeout_secs
        {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs_f64(secs.max(0.0)), outcome).await {
                    Ok(Ok(inner)) => inner,
                    Ok(Err(join_err)) => Err(Self::panic_message(&job, join_err)),
                    Err(_elapsed) => {
                        return self.handle_timeout(job, &task.hooks, started).await;
                    }
                }
            }
            None => match outcome.await {
                Ok(inner) => inner,
                Err(join_err) => Err(Self::panic_message(&job, join_err)),
            },
        };

        let duration = started.elapsed();
        match attempt_result {
            Ok(value) => self.finish_success(job, &task.hooks, value, duration).await,
            Err(err_summary) => self.handle_failure(job, &task.hooks, err_summary, duration).await,
        }
    }

    fn panic_message(job: &Job, join_err: tokio::task::JoinError) -> String {
        warn!("Task callable panicked for job \"{}\": {}", job.id, join_err);
        format!("task panicked: {join_err}")
    }

    async fn handle_failure(
        &self,
        mut job: Job,
        hooks: &crate::task::TaskHooks,
        err_summary: String,
        duration: Duration,
    ) -> Result<()> {
        if let Some(on_error) = &hooks.on_error {
            let on_error = Arc::clone(on_error);
            let msg = err_summary.clone();
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| on_error(&msg))) {
                warn!("on_error hook panicked for job \"{}\": {:?}", job.id, e);
            }
        }
        job.attempts.push(Attempt {
            started_at: job.started_at.unwrap_or_else(SystemTime::now),
            finished_at: Some(SystemTime::now()),
            outcome: AttemptOutcome::Failure,
            traceback: Some(err_summary.clone()),
        });

        if job.has_retries_left() {
            job.consume_retry();
            job.status = JobStatus::Pending;
            debug!(
                "Job \"{}\" failed, {} retries left, requeueing after {}s",
                job.id, job.retries_left, job.retry_delay_secs
            );
            metrics::record_retried();
            let delay = Duration::from_secs(job.retry_delay_secs);
            let id = job.id.clone();
            with_backend_retry("nack", || self.queue.nack(&id, delay)).await?;
        } else {
            self.finish_failed(&mut job, JobStatus::Failed, &err_summary, None)
                .await?;
        }
        metrics::record_failed(duration);
        Ok(())
    }

    async fn handle_timeout(
        &self,
        mut job: Job,
        hooks: &crate::task::TaskHooks,
        started: Instant,
    ) -> Result<()> {
        let duration = started.elapsed();
        if let Some(on_error) = &hooks.on_error {
            let on_error = Arc::clone(on_error);
            if let Err(e) =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| on_error("timeout")))
            {
                warn!("on_error hook panicked for job \"{}\": {:?}", job.id, e);
            }
        }
        job.attempts.push(Attempt {
            started_at: job.started_at.unwrap_or_else(SystemTime::now),
            finished_at: Some(SystemTime::now()),
            outcome: AttemptOutcome::Timeout,
            traceback: None,
        });

        match job.timeout_policy {
            TimeoutPolicy::Retry if job.has_retries_left() => {
                job.consume_retry();
                job.status = JobStatus::Pending;
                metrics::record_retried();
                let delay = Duration::from_secs(job.retry_delay_secs);
                let id = job.id.clone();
                with_backend_retry("nack", || self.queue.nack(&id, delay)).await?;
            }
            TimeoutPolicy::Ignore => {
                job.status = JobStatus::Timeout;
                job.finished_at = Some(SystemTime::now());
                if job.store_result {
                    let id = job.id.clone();
                    let func = job.func_name.clone();
                    with_backend_retry("set_error", || {
                        self.results.set_error(&id, &func, JobStatus::Timeout, "timeout", None)
                    })
                    .await?;
                }
                let id = job.id.clone();
                with_backend_retry("ack", || self.queue.ack(&id)).await?;
            }
            TimeoutPolicy::Retry | TimeoutPolicy::Fail => {
                self.finish_failed(&mut job, JobStatus::Timeout, "job timed out", None)
                    .await?;
            }
        }
        metrics::record_timed_out(duration);
        Ok(())
    }

    async fn finish_success(
        &self,
        mut job: Job,
        hooks: &crate::task::TaskHooks,
        value: serde_json::Value,
        duration: Duration,
    ) -> Result<()> {
        if let Some(after) = &hooks.after {
            let after = Arc::clone(after);
            let value = value.clone();
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| after(&value))) {
                warn!("after hook panicked for job \"{}\": {:?}", job.id, e);
            }
        }
        job.status = JobStatus::Success;
        job.finished_at = Some(SystemTime::now());
        job.attempts.push(Attempt {
            started_at: job.started_at.unwrap_or_else(SystemTime::now),
            finished_at: job.finished_at,
            outcome: AttemptOutcome::Success,
            traceback: None,
        });

        if job.store_result {
            let id = job.id.clone();
            let func = job.func_name.clone();
            let value = value.clone();
            with_backend_retry("set_result", || {
                self.results.set_result(&id, &func, value.clone())
            })
            .await?;
        }
        let id = job.id.clone();
        with_backend_retry("ack", || self.queue.ack(&id)).await?;
        metrics::record_succeeded(duration);
        Ok(())
    }

    /// Persists a terminal failure and acks the lease. Used when a task is
    /// unknown, when a failing job has exhausted its retries, and when a
    /// timed-out job's policy routes it to a terminal outcome; `status`
    /// distinguishes `Failed` from `Timeout` in the persisted record.
    async fn finish_failed(
        &self,
        job: &mut Job,
        status: JobStatus,
        error_summary: &str,
        traceback: Option<String>,
    ) -> Result<()> {
        job.status = status;
        job.finished_at = Some(SystemTime::now());
        if job.store_result {
            let id = job.id.clone();
            let func = job.func_name.clone();
            let summary = error_summary.to_string();
            let tb = traceback.clone();
            with_backend_retry("set_error", || {
                self.results.set_error(&id, &func, status, &summary, tb.clone())
            })
            .await?;
        }
        let id = job.id.clone();
        with_backend_retry("ack", || self.queue.ack(&id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use crate::queue::MemoryQueue;
    use crate::result::MemoryResultBackend;
    use crate::task::{RegisterMode, TaskDefinition, TaskHooks};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner_with(tasks: TaskRegistry) -> (JobRunner, Arc<MemoryQueue>, Arc<MemoryResultBackend>) {
        let queue = Arc::new(MemoryQueue::default());
        let results = Arc::new(MemoryResultBackend::new());
        let runner = JobRunner::new(Arc::new(tasks), Arc::clone(&queue), Arc::clone(&results));
        (runner, queue, results)
    }

    fn register(tasks: &TaskRegistry, name: &str, callable: crate::task::TaskFn) {
        tasks
            .register(
                TaskDefinition {
                    name: name.to_string(),
                    callable,
                    retries: 0,
                    retry_delay_secs: 0,
                    timeout_secs: None,
                    timeout_policy: TimeoutPolicy::Fail,
                    store_result: true,
                    hooks: TaskHooks::default(),
                    tags: vec![],
                    description: None,
                },
                RegisterMode::Strict,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn successful_job_stores_result_and_acks() {
        let tasks = TaskRegistry::new();
        register(&tasks, "add", Arc::new(|args, _kwargs| {
            let sum = args[0].as_i64().unwrap() + args[1].as_i64().unwrap();
            Ok(serde_json::json!(sum))
        }));
        let (runner, queue, results) = runner_with(tasks);
        let job = Job::new(
            "add",
            vec![serde_json::json!(2), serde_json::json!(3)],
            serde_json::Map::new(),
            JobOptions::default(),
        );
        let id = job.id.clone();
        queue.enqueue(job.clone()).await.unwrap();
        runner.run_attempt(job).await.unwrap();
        assert_eq!(results.get_result(&id).await.unwrap(), Some(serde_json::json!(5)));
    }

    #[tokio::test]
    async fn failing_job_without_retries_is_terminal() {
        let tasks = TaskRegistry::new();
        register(&tasks, "boom", Arc::new(|_args, _kwargs| Err("kaboom".to_string())));
        let (runner, _queue, results) = runner_with(tasks);
        let job = Job::new("boom", vec![], serde_json::Map::new(), JobOptions::default());
        let id = job.id.clone();
        runner.run_attempt(job).await.unwrap();
        let full = results.get_full(&id).await.unwrap().unwrap();
        assert_eq!(full.status, JobStatus::Failed);
        assert_eq!(full.error.as_deref(), Some("kaboom"));
    }

    #[tokio::test]
    async fn failing_job_with_retries_is_requeued_not_terminal() {
        let tasks = TaskRegistry::new();
        register(&tasks, "boom", Arc::new(|_args, _kwargs| Err("kaboom".to_string())));
        let (runner, queue, results) = runner_with(tasks);
        let job = Job::new(
            "boom",
            vec![],
            serde_json::Map::new(),
            JobOptions {
                max_retries: 1,
                ..Default::default()
            },
        );
        let id = job.id.clone();
        queue.enqueue(job.clone()).await.unwrap();
        runner.run_attempt(job).await.unwrap();
        assert!(results.get_full(&id).await.unwrap().is_none());
        assert_eq!(queue.qsize().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_task_is_terminal_failure() {
        let (runner, _queue, results) = runner_with(TaskRegistry::new());
        let job = Job::new("missing", vec![], serde_json::Map::new(), JobOptions::default());
        let id = job.id.clone();
        runner.run_attempt(job).await.unwrap();
        let full = results.get_full(&id).await.unwrap().unwrap();
        assert_eq!(full.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn hooks_are_invoked_on_success() {
        let tasks = TaskRegistry::new();
        let after_called = Arc::new(AtomicUsize::new(0));
        let after_called2 = Arc::clone(&after_called);
        tasks
            .register(
                TaskDefinition {
                    name: "noop".to_string(),
                    callable: Arc::new(|_a, _k| Ok(serde_json::Value::Null)),
                    retries: 0,
                    retry_delay_secs: 0,
                    timeout_secs: None,
                    timeout_policy: TimeoutPolicy::Fail,
                    store_result: true,
                    hooks: TaskHooks {
                        before: None,
                        after: Some(Arc::new(move |_v| {
                            after_called2.fetch_add(1, Ordering::SeqCst);
                        })),
                        on_error: None,
                    },
                    tags: vec![],
                    description: None,
                },
                RegisterMode::Strict,
            )
            .unwrap();
        let (runner, _queue, _results) = runner_with(tasks);
        let job = Job::new("noop", vec![], serde_json::Map::new(), JobOptions::default());
        runner.run_attempt(job).await.unwrap();
        assert_eq!(after_called.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_with_ignore_policy_acks_without_retry() {
        let tasks = TaskRegistry::new();
        tasks
            .register(
                TaskDefinition {
                    name: "slow".to_string(),
                    callable: Arc::new(|_a, _k| {
                        std::thread::sleep(Duration::from_millis(200));
                        Ok(serde_json::Value::Null)
                    }),
                    retries: 2,
                    retry_delay_secs: 0,
                    timeout_secs: Some(0.02),
                    timeout_policy: TimeoutPolicy::Ignore,
                    store_result: true,
                    hooks: TaskHooks::default(),
                    tags: vec![],
                    description: None,
                },
                RegisterMode::Strict,
            )
            .unwrap();
        let (runner, _queue, results) = runner_with(tasks);
        let job = Job::new(
            "slow",
            vec![],
            serde_json::Map::new(),
            JobOptions {
                max_retries: 2,
                timeout_secs: Some(0.02),
                timeout_policy: TimeoutPolicy::Ignore,
                ..Default::default()
            },
        );
        let id = job.id.clone();
        runner.run_attempt(job).await.unwrap();
        let full = results.get_full(&id).await.unwrap().unwrap();
        assert_eq!(full.status, JobStatus::Timeout);
    }
}
