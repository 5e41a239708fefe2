//! In-memory result backend
use super::{JobSummary, ListFilter, ResultBackend, ResultRecord};
use crate::error::Result;
use crate::job::JobStatus;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

#[derive(Default)]
pub struct MemoryResultBackend {
    records: RwLock<HashMap<String, ResultRecord>>,
}

impl MemoryResultBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultBackend for MemoryResultBackend {
    async fn set_result(&self, id: &str, func_name: &str, value: serde_json::Value) -> Result<()> {
        let mut records = self.records.write().unwrap();
        records.insert(
            id.to_string(),
            ResultRecord {
                id: id.to_string(),
                func_name: func_name.to_string(),
                status: JobStatus::Success,
                value: Some(value),
                error: None,
                traceback: None,
                started_at: None,
                finished_at: Some(SystemTime::now()),
            },
        );
        Ok(())
    }

    async fn set_error(
        &self,
        id: &str,
        func_name: &str,
        status: JobStatus,
        error_summary: &str,
        traceback: Option<String>,
    ) -> Result<()> {
        let mut records = self.records.write().unwrap();
        records.insert(
            id.to_string(),
            ResultRecord {
                id: id.to_string(),
                func_name: func_name.to_string(),
                status,
                value: None,
                error: Some(error_summary.to_string()),
                traceback,
                started_at: None,
                finished_at: Some(SystemTime::now()),
            },
        );
        Ok(())
    }

    async fn get_result(&self, id: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .records
            .read()
            .unwrap()
            .get(id)
            .and_then(|r| r.value.clone()))
    }

    async fn get_error(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .records
            .read()
            .unwrap()
            .get(id)
            .and_then(|r| r.error.clone()))
    }

    async fn get_full(&self, id: &str) -> Result<Option<ResultRecord>> {
        Ok(self.records.read().unwrap().get(id).cloned())
    }

    async fn list_jobs(&self, filter: ListFilter) -> Result<Vec<JobSummary>> {
        let records = self.records.read().unwrap();
        let mut summaries: Vec<JobSummary> = records
            .values()
            .filter(|r| filter.status.map(|s| s == r.status).unwrap_or(true))
            .map(|r| JobSummary {
                id: r.id.clone(),
                func_name: r.func_name.clone(),
                status: r.status,
                finished_at: r.finished_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        if let Some(limit) = filter.limit {
            summaries.truncate(limit);
        }
        Ok(summaries)
    }
}
