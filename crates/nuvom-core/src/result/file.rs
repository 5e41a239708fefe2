//! File-backed result store
//!
//! One file per job id under `<root>/<id>.res`, holding a single
//! newline-terminated JSON record. Writes are atomic (`*.tmp` then
//! rename), matching the file queue's write discipline.
use super::{JobSummary, ListFilter, ResultBackend, ResultRecord};
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
#[allow(unused_imports)]
use tracing::{debug, error, warn};

pub struct FileResultBackend {
    root: PathBuf,
}

impl FileResultBackend {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.res"))
    }

    async fn write_record(&self, record: &ResultRecord) -> Result<()> {
        let path = self.path_for(&record.id);
        let tmp_path = path.with_extension("res.tmp");
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        tokio::fs::write(&tmp_path, line.as_bytes()).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn read_record(path: &Path) -> Result<Option<ResultRecord>> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(contents.trim_end())?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ResultBackend for FileResultBackend {
    async fn set_result(&self, id: &str, func_name: &str, value: serde_json::Value) -> Result<()> {
        self.write_record(&ResultRecord {
            id: id.to_string(),
            func_name: func_name.to_string(),
            status: crate::job::JobStatus::Success,
            value: Some(value),
            error: None,
            traceback: None,
            started_at: None,
            finished_at: Some(std::time::SystemTime::now()),
        })
        .await
    }

    async fn set_error(
        &self,
        id: &str,
        func_name: &str,
        status: crate::job::JobStatus,
        error_summary: &str,
        traceback: Option<String>,
    ) -> Result<()> {
        self.write_record(&ResultRecord {
            id: id.to_string(),
            func_name: func_name.to_string(),
            status,
            value: None,
            error: Some(error_summary.to_string()),
            traceback,
            started_at: None,
            finished_at: Some(std::time::SystemTime::now()),
        })
        .await
    }

    async fn get_result(&self, id: &str) -> Result<Option<serde_json::Value>> {
        Ok(Self::read_record(&self.path_for(id)).await?.and_then(|r| r.value))
    }

    async fn get_error(&self, id: &str) -> Result<Option<String>> {
        Ok(Self::read_record(&self.path_for(id)).await?.and_then(|r| r.error))
    }

    async fn get_full(&self, id: &str) -> Result<Option<ResultRecord>> {
        Self::read_record(&self.path_for(id)).await
    }

    async fn list_jobs(&self, filter: ListFilter) -> Result<Vec<JobSummary>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("res") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) => {
                    if filter.status.map(|s| s == record.status).unwrap_or(true) {
                        summaries.push(JobSummary {
                            id: record.id,
                            func_name: record.func_name,
                            status: record.status,
                            finished_at: record.finished_at,
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to read result record \"{}\": {}", path.display(), e),
            }
        }
        summaries.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        if let Some(limit) = filter.limit {
            summaries.truncate(limit);
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;

    #[tokio::test]
    async fn set_and_get_result() {
        let dir = tempfile::tempdir().unwrap();
        let be = FileResultBackend::new(dir.path()).await.unwrap();
        be.set_result("J1", "add", serde_json::json!(5)).await.unwrap();
        assert_eq!(be.get_result("J1").await.unwrap(), Some(serde_json::json!(5)));
    }

    #[tokio::test]
    async fn set_and_get_error() {
        let dir = tempfile::tempdir().unwrap();
        let be = FileResultBackend::new(dir.path()).await.unwrap();
        be.set_error(
            "J1",
            "boom",
            JobStatus::Failed,
            "RuntimeError: x",
            Some("tb".to_string()),
        )
        .await
        .unwrap();
        let full = be.get_full("J1").await.unwrap().unwrap();
        assert_eq!(full.status, JobStatus::Failed);
        assert_eq!(full.traceback.as_deref(), Some("tb"));
    }

    #[tokio::test]
    async fn missing_record_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let be = FileResultBackend::new(dir.path()).await.unwrap();
        assert_eq!(be.get_full("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_jobs_respects_filter_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let be = FileResultBackend::new(dir.path()).await.unwrap();
        be.set_result("J1", "add", serde_json::json!(1)).await.unwrap();
        be.set_error("J2", "boom", JobStatus::Failed, "err", None).await.unwrap();
        let failed = be
            .list_jobs(ListFilter {
                status: Some(JobStatus::Failed),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "J2");
    }
}
