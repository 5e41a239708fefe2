//! File-backed persistent queue
//!
//! Every pending job is a single file under `<root>/pending`, named
//! `<created_at_ns>-<id>.rec` so that lexicographic filename order gives
//! arrival order. Writes are atomic: write to `*.tmp` then rename into
//! place. A successful dequeue moves the file into `<root>/inflight` via
//! another atomic rename, which doubles as the claim: only one racer wins
//! the rename. A background sweeper reclaims leases whose holder never
//! acked (file mtime in `inflight/` older than the visibility timeout) and
//! promotes delayed nacks from `<root>/delayed` back to `pending` once due.
//! A decode failure quarantines the file to `<root>/<name>.corrupt`.
use super::QueueBackend;
use crate::codec;
use crate::error::{NuvomError, Result};
use crate::job::Job;
use crate::utils::now_ns;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

const REC_SUFFIX: &str = ".rec";

pub struct FileQueue {
    root: PathBuf,
    pending_dir: PathBuf,
    inflight_dir: PathBuf,
    delayed_dir: PathBuf,
    visibility_timeout: Duration,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub leases_reclaimed: usize,
    pub delayed_promoted: usize,
    pub quarantined: usize,
}

impl FileQueue {
    pub async fn new(root: impl Into<PathBuf>, visibility_timeout: Duration) -> Result<Self> {
        let root = root.into();
        let pending_dir = root.join("pending");
        let inflight_dir = root.join("inflight");
        let delayed_dir = root.join("delayed");
        for dir in [&pending_dir, &inflight_dir, &delayed_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                error!("Failed to create queue directory \"{}\": {}", dir.display(), e);
                e
            })?;
        }
        Ok(Self {
            root,
            pending_dir,
            inflight_dir,
            delayed_dir,
            visibility_timeout,
        })
    }

    /// Spawns the background sweeper on a cloned handle. The caller owns
    /// the returned [`JoinHandle`] and decides when to abort it (shutdown).
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if let Err(e) = queue.sweep_once().await {
                    warn!("File queue sweep failed: {}", e);
                }
            }
        })
    }

    /// Runs one pass of lease reclamation and delayed-nack promotion.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        self.reclaim_expired_leases(&mut report).await?;
        self.promote_due_delayed(&mut report).await?;
        Ok(report)
    }

    async fn reclaim_expired_leases(&self, report: &mut SweepReport) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.inflight_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("rec") {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .unwrap_or_default();
            if age >= self.visibility_timeout {
                let target = self.pending_dir.join(path.file_name().unwrap());
                match tokio::fs::rename(&path, &target).await {
                    Ok(()) => {
                        debug!("Reclaimed expired lease for \"{}\"", path.display());
                        report.leases_reclaimed += 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    async fn promote_due_delayed(&self, report: &mut SweepReport) -> Result<()> {
        let now = now_ns();
        let mut entries = tokio::fs::read_dir(&self.delayed_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(fname) = path.file_name().and_then(|f| f.to_str()) else {
                continue;
            };
            let Some(due_str) = fname.split('-').next() else {
                continue;
            };
            let Ok(due_ns) = due_str.parse::<u128>() else {
                continue;
            };
            if due_ns <= now {
                let target = self.pending_dir.join(fname);
                match tokio::fs::rename(&path, &target).await {
                    Ok(()) => report.delayed_promoted += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    async fn quarantine(&self, path: &Path) {
        let corrupt_path = self
            .root
            .join(format!("{}.corrupt", path.file_name().unwrap().to_string_lossy()));
        warn!(
            "Quarantining unreadable queue record \"{}\" -> \"{}\"",
            path.display(),
            corrupt_path.display()
        );
        if let Err(e) = tokio::fs::rename(path, &corrupt_path).await {
            error!("Failed to quarantine \"{}\": {}", path.display(), e);
        }
    }

    async fn write_atomic(dir: &Path, filename: &str, bytes: &[u8]) -> Result<()> {
        let tmp_path = dir.join(format!("{filename}.tmp"));
        let final_path = dir.join(filename);
        {
            let mut f = tokio::fs::File::create(&tmp_path).await?;
            use tokio::io::AsyncWriteExt;
            f.write_all(bytes).await?;
            f.flush().await?;
            if let Ok(std_file) = f.try_into_std() {
                std_file.sync_all().ok();
            }
        }
        tokio::fs::rename(&tmp_path, &final_path).await?;
        if let Ok(dir_file) = std::fs::File::open(dir) {
            dir_file.sync_all().ok();
        }
        Ok(())
    }

    /// Best-effort, non-blocking claim of a single pending record.
    async fn try_claim_one(&self) -> Result<Option<Job>> {
        let mut names = self.sorted_pending_filenames().await?;
        names.sort();
        for fname in names {
            let src = self.pending_dir.join(&fname);
            let dst = self.inflight_dir.join(&fname);
            match tokio::fs::rename(&src, &dst).await {
                Ok(()) => match tokio::fs::read(&dst).await {
                    Ok(bytes) => match codec::decode(&bytes) {
                        Ok(job) => return Ok(Some(job)),
                        Err(e) => {
                            warn!("Corrupt queue record \"{}\": {}", fname, e);
                            self.quarantine(&dst).await;
                            continue;
                        }
                    },
                    Err(e) => return Err(e.into()),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn sorted_pending_filenames(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.pending_dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("rec") {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn filename_for(job: &Job) -> String {
        let created_ns = job
            .created_at
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        format!("{created_ns:020}-{}{REC_SUFFIX}", job.id)
    }

    async fn find_inflight_by_id(&self, id: &str) -> Result<Option<PathBuf>> {
        let suffix = format!("-{id}{REC_SUFFIX}");
        let mut entries = tokio::fs::read_dir(&self.inflight_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&suffix))
            {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl QueueBackend for FileQueue {
    async fn enqueue(&self, mut job: Job) -> Result<()> {
        job.mark_enqueued();
        let fname = Self::filename_for(&job);
        let bytes = codec::encode(&job)?;
        Self::write_atomic(&self.pending_dir, &fname, &bytes).await?;
        debug!("Enqueued job \"{}\" as \"{}\"", job.id, fname);
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.try_claim_one().await? {
                return Ok(Some(job));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let poll_interval = Duration::from_millis(50).min(deadline - now);
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn pop_batch(&self, n: usize) -> Result<Vec<Job>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.try_claim_one().await? {
                Some(job) => out.push(job),
                None => break,
            }
        }
        Ok(out)
    }

    async fn qsize(&self) -> Result<usize> {
        Ok(self.sorted_pending_filenames().await?.len())
    }

    async fn clear(&self) -> Result<()> {
        for dir in [&self.pending_dir, &self.inflight_dir, &self.delayed_dir] {
            let mut entries = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                tokio::fs::remove_file(entry.path()).await.ok();
            }
        }
        Ok(())
    }

    async fn ack(&self, id: &str) -> Result<()> {
        match self.find_inflight_by_id(id).await? {
            Some(path) => {
                tokio::fs::remove_file(&path).await?;
                Ok(())
            }
            None => Err(NuvomError::BackendUnavailable(format!(
                "no in-flight record for job {id}"
            ))),
        }
    }

    async fn nack(&self, id: &str, requeue_delay: Duration) -> Result<()> {
        let path = self.find_inflight_by_id(id).await?.ok_or_else(|| {
            NuvomError::BackendUnavailable(format!("no in-flight record for job {id}"))
        })?;
        let fname = path.file_name().unwrap().to_str().unwrap().to_string();
        if requeue_delay.is_zero() {
            let target = self.pending_dir.join(&fname);
            tokio::fs::rename(&path, &target).await?;
        } else {
            let due_ns = now_ns() + requeue_delay.as_nanos();
            let suffix = fname.split_once('-').map(|(_, s)| s).unwrap_or(&fname);
            let delayed_name = format!("{due_ns:020}-{suffix}");
            let target = self.delayed_dir.join(&delayed_name);
            tokio::fs::rename(&path, &target).await?;
        }
        Ok(())
    }
}
