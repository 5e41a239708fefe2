//! Result backend contract and built-in implementations
mod file;
mod memory;
mod sqlite;

pub use file::FileResultBackend;
pub use memory::MemoryResultBackend;
pub use sqlite::SqliteResultBackend;

use crate::error::Result;
use crate::job::JobStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// The complete terminal record for a job, as persisted by a result backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultRecord {
    pub id: String,
    pub func_name: String,
    pub status: JobStatus,
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
}

/// A lightweight summary, as returned by [`ResultBackend::list_jobs`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSummary {
    pub id: String,
    pub func_name: String,
    pub status: JobStatus,
    pub finished_at: Option<SystemTime>,
}

/// Filter accepted by [`ResultBackend::list_jobs`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

/// A swappable implementation of result/metadata storage, keyed by job id.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Persists a terminal success.
    async fn set_result(&self, id: &str, func_name: &str, value: serde_json::Value) -> Result<()>;

    /// Persists a terminal failure. `status` distinguishes the terminal
    /// kind (`Failed` vs `Timeout`) since both reach this method.
    async fn set_error(
        &self,
        id: &str,
        func_name: &str,
        status: JobStatus,
        error_summary: &str,
        traceback: Option<String>,
    ) -> Result<()>;

    /// Returns the success value, or `None` if absent or terminal-failed.
    async fn get_result(&self, id: &str) -> Result<Option<serde_json::Value>>;

    /// Returns the error summary, or `None` if absent or terminal-succeeded.
    async fn get_error(&self, id: &str) -> Result<Option<String>>;

    /// Returns the complete metadata record, or `None` if absent.
    async fn get_full(&self, id: &str) -> Result<Option<ResultRecord>>;

    /// Lists summaries matching `filter`, newest-first by `finished_at`.
    async fn list_jobs(&self, filter: ListFilter) -> Result<Vec<JobSummary>>;
}
