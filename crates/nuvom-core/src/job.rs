//! The job record and its lifecycle types
use crate::utils::random_id;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Governs what happens to a job that exceeds its wall-clock timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Decrement the retry budget and requeue; terminal `Timeout` once exhausted.
    Retry,
    /// Terminal `Timeout` immediately.
    Fail,
    /// Ack without retry; record `Timeout` without a traceback.
    Ignore,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::Fail
    }
}

/// The lifecycle state of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are never replaced (§3 invariant).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Timeout | JobStatus::Cancelled
        )
    }
}

/// The outcome of a single execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
}

/// One recorded execution attempt of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub started_at: SystemTime,
    pub finished_at: Option<SystemTime>,
    pub outcome: AttemptOutcome,
    pub traceback: Option<String>,
}

/// Parameters controlling how a job is submitted and retried, independent
/// of its arguments. Mirrors the defaults carried by a [`TaskDefinition`](crate::task::TaskDefinition)
/// but may be overridden per submission.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub timeout_secs: Option<f64>,
    pub timeout_policy: TimeoutPolicy,
    pub store_result: bool,
    pub tags: Vec<String>,
    pub description: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay_secs: 0,
            timeout_secs: None,
            timeout_policy: TimeoutPolicy::default(),
            store_result: true,
            tags: Vec::new(),
            description: None,
        }
    }
}

/// A durable, serializable invocation of a registered task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub func_name: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub retries_left: u32,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub timeout_secs: Option<f64>,
    pub timeout_policy: TimeoutPolicy,
    pub store_result: bool,
    pub created_at: SystemTime,
    pub enqueued_at: Option<SystemTime>,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub attempts: Vec<Attempt>,
    pub status: JobStatus,
    pub tags: Vec<String>,
    pub description: Option<String>,
}

impl Job {
    /// Builds a new pending job with a freshly generated id.
    pub fn new(
        func_name: impl Into<String>,
        args: Vec<serde_json::Value>,
        kwargs: serde_json::Map<String, serde_json::Value>,
        opts: JobOptions,
    ) -> Self {
        Self {
            id: random_id(),
            func_name: func_name.into(),
            args,
            kwargs,
            retries_left: opts.max_retries,
            max_retries: opts.max_retries,
            retry_delay_secs: opts.retry_delay_secs,
            timeout_secs: opts.timeout_secs,
            timeout_policy: opts.timeout_policy,
            store_result: opts.store_result,
            created_at: SystemTime::now(),
            enqueued_at: None,
            started_at: None,
            finished_at: None,
            attempts: Vec::new(),
            status: JobStatus::Pending,
            tags: opts.tags,
            description: opts.description,
        }
    }

    /// Marks this job as visible in a queue for the first time.
    pub fn mark_enqueued(&mut self) {
        if self.enqueued_at.is_none() {
            self.enqueued_at = Some(SystemTime::now());
        }
    }

    /// True if there is at least one retry left in the budget.
    pub fn has_retries_left(&self) -> bool {
        self.retries_left > 0
    }

    /// Consumes one unit of retry budget. Never goes below zero.
    pub fn consume_retry(&mut self) {
        self.retries_left = self.retries_left.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_pending_with_full_retry_budget() {
        let job = Job::new(
            "add",
            vec![serde_json::json!(2), serde_json::json!(3)],
            serde_json::Map::new(),
            JobOptions {
                max_retries: 2,
                ..Default::default()
            },
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retries_left, 2);
        assert_eq!(job.max_retries, 2);
        assert!(job.enqueued_at.is_none());
    }

    #[test]
    fn consume_retry_never_underflows() {
        let mut job = Job::new("noop", vec![], serde_json::Map::new(), JobOptions::default());
        job.consume_retry();
        job.consume_retry();
        assert_eq!(job.retries_left, 0);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
