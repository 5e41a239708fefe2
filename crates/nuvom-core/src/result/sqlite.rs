//! Embedded-relational result backend
//!
//! A single-file SQLite database with a `results` table indexed on `id`,
//! `status` and `finished_at`, per the persisted-layout contract.
use super::{JobSummary, ListFilter, ResultBackend, ResultRecord};
use crate::error::{NuvomError, Result};
use crate::job::JobStatus;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct SqliteResultBackend {
    conn: Arc<Mutex<Connection>>,
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "PENDING",
        JobStatus::Running => "RUNNING",
        JobStatus::Success => "SUCCESS",
        JobStatus::Failed => "FAILED",
        JobStatus::Timeout => "TIMEOUT",
        JobStatus::Cancelled => "CANCELLED",
    }
}

fn status_from_str(s: &str) -> Result<JobStatus> {
    Ok(match s {
        "PENDING" => JobStatus::Pending,
        "RUNNING" => JobStatus::Running,
        "SUCCESS" => JobStatus::Success,
        "FAILED" => JobStatus::Failed,
        "TIMEOUT" => JobStatus::Timeout,
        "CANCELLED" => JobStatus::Cancelled,
        other => return Err(NuvomError::CorruptRecord(format!("unknown status {other}"))),
    })
}

fn join_err(e: tokio::task::JoinError) -> NuvomError {
    NuvomError::BackendUnavailable(format!("sqlite worker task panicked: {e}"))
}

fn secs_to_systime(secs: Option<i64>) -> Option<std::time::SystemTime> {
    secs.map(|s| std::time::UNIX_EPOCH + std::time::Duration::from_secs(s.max(0) as u64))
}

struct Row {
    id: String,
    func_name: String,
    status: String,
    value: Option<Vec<u8>>,
    error: Option<String>,
    traceback: Option<String>,
    started_at: Option<i64>,
    finished_at: Option<i64>,
}

impl Row {
    fn into_record(self) -> Result<ResultRecord> {
        Ok(ResultRecord {
            id: self.id,
            func_name: self.func_name,
            status: status_from_str(&self.status)?,
            value: self
                .value
                .map(|bytes| serde_json::from_slice(&bytes))
                .transpose()?,
            error: self.error,
            traceback: self.traceback,
            started_at: secs_to_systime(self.started_at),
            finished_at: secs_to_systime(self.finished_at),
        })
    }
}

impl SqliteResultBackend {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS results (
                id TEXT PRIMARY KEY,
                func_name TEXT NOT NULL,
                status TEXT NOT NULL,
                value BLOB,
                error TEXT,
                traceback TEXT,
                started_at INTEGER,
                finished_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_results_status ON results (status);
            CREATE INDEX IF NOT EXISTS idx_results_finished_at ON results (finished_at);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn upsert(&self, record: &ResultRecord) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let id = record.id.clone();
        let func_name = record.func_name.clone();
        let status = status_to_str(record.status).to_string();
        let value = record
            .value
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()?;
        let error = record.error.clone();
        let traceback = record.traceback.clone();
        let finished_at = record
            .finished_at
            .map(|_| now_secs())
            .unwrap_or_else(now_secs);
        tokio::task::spawn_blocking(move || {
            conn.lock().unwrap().execute(
                "INSERT INTO results (id, func_name, status, value, error, traceback, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    func_name=excluded.func_name, status=excluded.status, value=excluded.value,
                    error=excluded.error, traceback=excluded.traceback, finished_at=excluded.finished_at",
                params![id, func_name, status, value, error, traceback, finished_at],
            )
        })
        .await
        .map_err(join_err)?
        .map_err(NuvomError::from)?;
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<Option<Row>> {
        let conn = Arc::clone(&self.conn);
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            conn.lock().unwrap().query_row(
                "SELECT id, func_name, status, value, error, traceback, started_at, finished_at
                 FROM results WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Row {
                        id: row.get(0)?,
                        func_name: row.get(1)?,
                        status: row.get(2)?,
                        value: row.get(3)?,
                        error: row.get(4)?,
                        traceback: row.get(5)?,
                        started_at: row.get(6)?,
                        finished_at: row.get(7)?,
                    })
                },
            ).optional()
        })
        .await
        .map_err(join_err)?
        .map_err(NuvomError::from)
    }
}

#[async_trait]
impl ResultBackend for SqliteResultBackend {
    async fn set_result(&self, id: &str, func_name: &str, value: serde_json::Value) -> Result<()> {
        self.upsert(&ResultRecord {
            id: id.to_string(),
            func_name: func_name.to_string(),
            status: JobStatus::Success,
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
        status: JobStatus,
        error_summary: &str,
        traceback: Option<String>,
    ) -> Result<()> {
        self.upsert(&ResultRecord {
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
        Ok(self
            .fetch(id)
            .await?
            .map(Row::into_record)
            .transpose()?
            .and_then(|r| r.value))
    }

    async fn get_error(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .fetch(id)
            .await?
            .map(Row::into_record)
            .transpose()?
            .and_then(|r| r.error))
    }

    async fn get_full(&self, id: &str) -> Result<Option<ResultRecord>> {
        self.fetch(id).await?.map(Row::into_record).transpose()
    }

    async fn list_jobs(&self, filter: ListFilter) -> Result<Vec<JobSummary>> {
        let conn = Arc::clone(&self.conn);
        let status_filter = filter.status.map(status_to_str);
        let limit = filter.limit.unwrap_or(i64::MAX as usize) as i64;
        let rows = tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<(String, String, String, Option<i64>)>> {
            let conn = conn.lock().unwrap();
            let sql = "SELECT id, func_name, status, finished_at FROM results
                       WHERE (?1 IS NULL OR status = ?1)
                       ORDER BY finished_at DESC LIMIT ?2";
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![status_filter, limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect()
        })
        .await
        .map_err(join_err)?
        .map_err(NuvomError::from)?;

        rows.into_iter()
            .map(|(id, func_name, status, finished_at)| {
                Ok(JobSummary {
                    id,
                    func_name,
                    status: status_from_str(&status)?,
                    finished_at: secs_to_systime(finished_at),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_get_result() {
        let dir = tempfile::tempdir().unwrap();
        let be = SqliteResultBackend::new(dir.path().join("results.db")).unwrap();
        be.set_result("J1", "add", serde_json::json!(5)).await.unwrap();
        assert_eq!(be.get_result("J1").await.unwrap(), Some(serde_json::json!(5)));
    }

    #[tokio::test]
    async fn set_and_get_error() {
        let dir = tempfile::tempdir().unwrap();
        let be = SqliteResultBackend::new(dir.path().join("results.db")).unwrap();
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
    }

    #[tokio::test]
    async fn list_jobs_filters_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let be = SqliteResultBackend::new(dir.path().join("results.db")).unwrap();
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
