//! Job store with JSON file backing.
//!
//! Records are replaced whole on every write, so readers never see a torn
//! job. Every upsert is also published on a broadcast channel for streaming
//! status consumers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::job::{Job, JobStatus};

/// Reason recorded on jobs that were running when the process stopped.
pub const ORPHAN_REASON: &str = "interrupted by service restart";

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Number of jobs in each status.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    storage_path: Option<PathBuf>,
    /// Serializes snapshot writes so the newest snapshot lands last.
    persist_lock: Mutex<()>,
    updates: broadcast::Sender<Job>,
}

impl JobStore {
    /// Store without disk persistence.
    pub fn in_memory() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            jobs: RwLock::new(HashMap::new()),
            storage_path: None,
            persist_lock: Mutex::new(()),
            updates,
        }
    }

    /// Open the store at `storage_path`, loading existing jobs.
    ///
    /// Jobs left `queued` or `running` by a previous process have no owner
    /// anymore and are marked failed.
    pub async fn open(storage_path: PathBuf) -> Self {
        let mut store = Self::in_memory();
        store.storage_path = Some(storage_path);

        let mut jobs = match store.load_from_disk() {
            Ok(loaded) => loaded,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                tracing::warn!("Job file is not valid JSON: {}", e);
                store.set_aside_corrupt_file().await;
                HashMap::new()
            }
            Err(e) => {
                tracing::warn!("Failed to load jobs from disk: {}", e);
                HashMap::new()
            }
        };

        let orphaned = recover_orphans(&mut jobs);
        if !orphaned.is_empty() {
            tracing::warn!(
                count = orphaned.len(),
                "Marked orphaned jobs as failed: {:?}",
                orphaned
            );
        }

        *store.jobs.write().await = jobs;

        if let Err(e) = store.save_to_disk().await {
            tracing::error!("Failed to save jobs to disk: {}", e);
        }

        store
    }

    /// Move an unreadable job file to `<name>.corrupt` so the next snapshot
    /// does not destroy it.
    async fn set_aside_corrupt_file(&self) {
        let Some(path) = &self.storage_path else {
            return;
        };
        let aside = corrupt_path(path);
        match tokio::fs::rename(path, &aside).await {
            Ok(()) => tracing::warn!(path = %aside.display(), "Kept unreadable job file aside"),
            Err(e) => tracing::error!("Failed to move unreadable job file aside: {}", e),
        }
    }

    fn load_from_disk(&self) -> Result<HashMap<Uuid, Job>, std::io::Error> {
        let Some(path) = &self.storage_path else {
            return Ok(HashMap::new());
        };
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let contents = std::fs::read_to_string(path)?;
        let jobs: Vec<Job> = serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        Ok(jobs.into_iter().map(|j| (j.id, j)).collect())
    }

    /// Write a snapshot of every job, via a temp file and rename.
    pub async fn save_to_disk(&self) -> Result<(), std::io::Error> {
        let Some(path) = &self.storage_path else {
            return Ok(());
        };

        let _guard = self.persist_lock.lock().await;
        let contents = {
            let jobs = self.jobs.read().await;
            let mut list: Vec<&Job> = jobs.values().collect();
            list.sort_by_key(|j| j.created_at);
            serde_json::to_string_pretty(&list)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> PipelineResult<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    /// Lookup by the raw identifier string a client sent.
    pub async fn get_by_str(&self, id: &str) -> PipelineResult<Job> {
        let id = Uuid::parse_str(id).map_err(|_| PipelineError::NotFound(id.to_string()))?;
        self.get(id).await
    }

    /// Replace the whole record for `job.id`, bumping `updated_at`.
    pub async fn upsert(&self, mut job: Job) {
        job.touch();
        {
            let mut jobs = self.jobs.write().await;
            jobs.insert(job.id, job.clone());
        }
        // No receivers is fine.
        let _ = self.updates.send(job);

        if let Err(e) = self.save_to_disk().await {
            tracing::error!("Failed to save jobs to disk: {}", e);
        }
    }

    /// All jobs, newest first.
    pub async fn list(&self) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<Job> = jobs.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub async fn counts(&self) -> StatusCounts {
        let jobs = self.jobs.read().await;
        let mut counts = StatusCounts::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Receive every record written from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Job> {
        self.updates.subscribe()
    }
}

/// Fail every non-terminal job. Returns the ids that were changed.
fn recover_orphans(jobs: &mut HashMap<Uuid, Job>) -> Vec<Uuid> {
    let mut changed = Vec::new();
    for job in jobs.values_mut() {
        if job.status.is_terminal() {
            continue;
        }
        job.status = JobStatus::Failed;
        job.output_path = None;
        job.error_message = Some(ORPHAN_REASON.to_string());
        job.stage_detail = format!("Error: {}", ORPHAN_REASON);
        job.touch();
        changed.push(job.id);
    }
    changed
}

/// Shared job store wrapped in Arc for concurrent access.
pub type SharedJobStore = Arc<JobStore>;

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}
