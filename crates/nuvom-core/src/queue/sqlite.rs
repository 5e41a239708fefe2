//! Embedded-relational queue backend
//!
//! A single-file SQLite database with one `jobs` table, as described in
//! the persisted-layout contract: `(id, payload, status, visible_at,
//! lease_expires_at, enqueued_at)`. Dequeue is a transactional `SELECT …
//! WHERE status='pending' AND visible_at <= now ORDER BY enqueued_at LIMIT
//! n` followed by an `UPDATE` marking the rows in-flight with a lease. A
//! periodic sweeper resets expired leases back to `pending`. Treated as
//! single-writer per database file (§9 Open Question).
use super::QueueBackend;
use crate::codec;
use crate::error::{NuvomError, Result};
use crate::job::Job;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
#[allow(unused_imports)]
use tracing::{debug, error, warn};

pub struct SqliteQueue {
    conn: Arc<Mutex<Connection>>,
    visibility_timeout_secs: i64,
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl SqliteQueue {
    pub fn new(path: impl AsRef<Path>, visibility_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                payload BLOB NOT NULL,
                status TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lease_expires_at INTEGER NOT NULL,
                enqueued_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status_visible
                ON jobs (status, visible_at);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            visibility_timeout_secs: visibility_timeout.as_secs() as i64,
        })
    }

    /// Spawns the background lease-reclamation sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                match queue.reclaim_expired_leases().await {
                    Ok(n) if n > 0 => debug!("Reclaimed {} expired sqlite leases", n),
                    Ok(_) => {}
                    Err(e) => warn!("Sqlite lease sweep failed: {}", e),
                }
            }
        })
    }

    async fn reclaim_expired_leases(&self) -> Result<usize> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "UPDATE jobs SET status='pending' WHERE status='inflight' AND lease_expires_at <= ?1",
                params![now_secs()],
            )
        })
        .await
        .map_err(join_err)?
        .map_err(NuvomError::from)
    }

    async fn claim_batch(&self, n: usize) -> Result<Vec<Job>> {
        let conn = Arc::clone(&self.conn);
        let visibility_timeout_secs = self.visibility_timeout_secs;
        let rows = tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<(String, Vec<u8>)>> {
            let mut conn = conn.lock().unwrap();
            let tx = conn.transaction()?;
            let now = now_secs();
            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM jobs WHERE status='pending' AND visible_at <= ?1
                     ORDER BY enqueued_at LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![now, n as i64], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()?
            };
            let mut claimed = Vec::with_capacity(ids.len());
            for id in ids {
                tx.execute(
                    "UPDATE jobs SET status='inflight', lease_expires_at = ?1 WHERE id = ?2",
                    params![now + visibility_timeout_secs, id],
                )?;
                let payload: Vec<u8> =
                    tx.query_row("SELECT payload FROM jobs WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })?;
                claimed.push((id, payload));
            }
            tx.commit()?;
            Ok(claimed)
        })
        .await
        .map_err(join_err)??;

        let mut jobs = Vec::with_capacity(rows.len());
        for (id, payload) in rows {
            match codec::decode(&payload) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!("Corrupt sqlite queue record \"{}\": {}", id, e);
                    self.quarantine(&id).await?;
                }
            }
        }
        Ok(jobs)
    }

    async fn quarantine(&self, id: &str) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap()
                .execute("UPDATE jobs SET status='corrupt' WHERE id = ?1", params![id])
        })
        .await
        .map_err(join_err)?
        .map_err(NuvomError::from)?;
        Ok(())
    }
}

fn join_err(e: tokio::task::JoinError) -> NuvomError {
    NuvomError::BackendUnavailable(format!("sqlite worker task panicked: {e}"))
}

#[async_trait]
impl QueueBackend for SqliteQueue {
    async fn enqueue(&self, mut job: Job) -> Result<()> {
        job.mark_enqueued();
        let bytes = codec::encode(&job)?;
        let conn = Arc::clone(&self.conn);
        let id = job.id.clone();
        let now = now_secs();
        tokio::task::spawn_blocking(move || {
            conn.lock().unwrap().execute(
                "INSERT INTO jobs (id, payload, status, visible_at, lease_expires_at, enqueued_at)
                 VALUES (?1, ?2, 'pending', ?3, 0, ?3)",
                params![id, bytes, now],
            )
        })
        .await
        .map_err(join_err)?
        .map_err(NuvomError::from)?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut batch = self.claim_batch(1).await?;
            if let Some(job) = batch.pop() {
                return Ok(Some(job));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let poll = Duration::from_millis(50).min(deadline - now);
            tokio::time::sleep(poll).await;
        }
    }

    async fn pop_batch(&self, n: usize) -> Result<Vec<Job>> {
        self.claim_batch(n).await
    }

    async fn qsize(&self) -> Result<usize> {
        let conn = Arc::clone(&self.conn);
        let now = now_secs();
        let count: i64 = tokio::task::spawn_blocking(move || {
            conn.lock().unwrap().query_row(
                "SELECT COUNT(*) FROM jobs WHERE status='pending' AND visible_at <= ?1",
                params![now],
                |row| row.get(0),
            )
        })
        .await
        .map_err(join_err)?
        .map_err(NuvomError::from)?;
        Ok(count as usize)
    }

    async fn clear(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || conn.lock().unwrap().execute("DELETE FROM jobs", []))
            .await
            .map_err(join_err)?
            .map_err(NuvomError::from)?;
        Ok(())
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let id = id.to_string();
        let changed = tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap()
                .execute("DELETE FROM jobs WHERE id = ?1", params![id])
        })
        .await
        .map_err(join_err)?
        .map_err(NuvomError::from)?;
        if changed == 0 {
            return Err(NuvomError::BackendUnavailable(format!(
                "no in-flight record for job {id}"
            )));
        }
        Ok(())
    }

    async fn nack(&self, id: &str, requeue_delay: Duration) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let id_owned = id.to_string();
        let visible_at = now_secs() + requeue_delay.as_secs() as i64;
        let changed = tokio::task::spawn_blocking(move || {
            conn.lock().unwrap().execute(
                "UPDATE jobs SET status='pending', visible_at=?1, lease_expires_at=0 WHERE id=?2",
                params![visible_at, id_owned],
            )
        })
        .await
        .map_err(join_err)?
        .map_err(NuvomError::from)?;
        if changed == 0 {
            return Err(NuvomError::BackendUnavailable(format!(
                "no in-flight record for job {id}"
            )));
        }
        Ok(())
    }
}

/// Fetches the full row for a job id, mostly useful in tests.
#[allow(dead_code)]
fn row_status(conn: &Connection, id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT status FROM jobs WHERE id = ?1", params![id], |row| row.get(0))
        .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;

    fn job(name: &str) -> Job {
        Job::new(name, vec![], serde_json::Map::new(), JobOptions::default())
    }

    #[tokio::test]
    async fn enqueue_dequeue_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let q = SqliteQueue::new(dir.path().join("queue.db"), Duration::from_secs(30)).unwrap();
        q.enqueue(job("add")).await.unwrap();
        let got = q.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(got.func_name, "add");
        assert_eq!(q.qsize().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ack_removes_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let q = SqliteQueue::new(dir.path().join("queue.db"), Duration::from_secs(30)).unwrap();
        q.enqueue(job("add")).await.unwrap();
        let got = q.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        q.ack(&got.id).await.unwrap();
        assert!(q.ack(&got.id).await.is_err());
    }

    #[tokio::test]
    async fn nack_makes_job_visible_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let q = SqliteQueue::new(dir.path().join("queue.db"), Duration::from_secs(30)).unwrap();
        q.enqueue(job("add")).await.unwrap();
        let got = q.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        q.nack(&got.id, Duration::from_secs(0)).await.unwrap();
        assert_eq!(q.qsize().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lease_recovery_after_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let q = SqliteQueue::new(dir.path().join("queue.db"), Duration::from_secs(0)).unwrap();
        q.enqueue(job("add")).await.unwrap();
        let got = q.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        let reclaimed = q.reclaim_expired_leases().await.unwrap();
        assert_eq!(reclaimed, 1);
        let redelivered = q.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(redelivered.id, got.id);
    }

    #[tokio::test]
    async fn pop_batch_claims_up_to_n() {
        let dir = tempfile::tempdir().unwrap();
        let q = SqliteQueue::new(dir.path().join("queue.db"), Duration::from_secs(30)).unwrap();
        for i in 0..4 {
            q.enqueue(job(&i.to_string())).await.unwrap();
        }
        let batch = q.pop_batch(3).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(q.qsize().await.unwrap(), 1);
    }
}
