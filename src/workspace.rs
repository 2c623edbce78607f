//! Per-job working copies of the video template project.
//!
//! A workspace is a fresh copy of the template directory with the (large)
//! dependency cache symlinked instead of copied. Each job owns exactly one
//! workspace and the manager refuses to hand out a second one for the same
//! job while the first is live.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{PipelineError, PipelineResult};

/// Template entries never copied into a workspace besides the cache itself.
const SKIPPED_ENTRIES: &[&str] = &["out", ".git"];
const WORKSPACE_PREFIX: &str = "work-";

/// What happens to a workspace once its job reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Delete after success, keep failed and timed-out runs for inspection.
    DeleteOnSuccess,
    /// Keep the newest `n` finished workspaces regardless of outcome.
    KeepLast(usize),
}

impl From<Option<usize>> for Retention {
    fn from(keep_last: Option<usize>) -> Self {
        keep_last.map_or(Self::DeleteOnSuccess, Self::KeepLast)
    }
}

/// An isolated working copy owned by a single job.
///
/// Not `Clone`: the generator takes it by `&mut`, so only one invocation can
/// ever run inside it at a time.
#[derive(Debug)]
pub struct Workspace {
    job_id: Uuid,
    path: PathBuf,
    cache_link: Option<PathBuf>,
}

impl Workspace {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the generator and renderer leave their artifacts.
    pub fn out_dir(&self) -> PathBuf {
        self.path.join("out")
    }

    /// Static assets (images, audio) the video references.
    pub fn public_dir(&self) -> PathBuf {
        self.path.join("public")
    }
}

pub struct WorkspaceManager {
    root: PathBuf,
    template_dir: PathBuf,
    cache_name: String,
    retention: Retention,
    active: Mutex<HashSet<Uuid>>,
}

impl WorkspaceManager {
    pub fn new(root: PathBuf, template_dir: PathBuf, cache_name: impl Into<String>, retention: Retention) -> Self {
        Self {
            root,
            template_dir,
            cache_name: cache_name.into(),
            retention,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn workspace_dir(&self, job_id: Uuid) -> PathBuf {
        self.root.join(format!("{}{}", WORKSPACE_PREFIX, job_id))
    }

    fn claim(&self, job_id: Uuid) -> bool {
        self.active
            .lock()
            .map(|mut active| active.insert(job_id))
            .unwrap_or(false)
    }

    fn release(&self, job_id: Uuid) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&job_id);
        }
    }

    fn is_active(&self, name: &str) -> bool {
        let Some(id) = name
            .strip_prefix(WORKSPACE_PREFIX)
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            return false;
        };
        self.active.lock().map(|a| a.contains(&id)).unwrap_or(true)
    }

    /// Copy the template into a fresh workspace for `job_id`.
    pub async fn create(&self, job_id: Uuid) -> PipelineResult<Workspace> {
        if !self.claim(job_id) {
            return Err(PipelineError::Workspace(format!(
                "a workspace for job {} is already in use",
                job_id
            )));
        }

        match self.build(job_id).await {
            Ok(workspace) => {
                tracing::info!(
                    job_id = %job_id,
                    path = %workspace.path.display(),
                    "Workspace ready"
                );
                Ok(workspace)
            }
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(self.workspace_dir(job_id)).await;
                self.release(job_id);
                Err(e)
            }
        }
    }

    async fn build(&self, job_id: Uuid) -> PipelineResult<Workspace> {
        let is_dir = tokio::fs::metadata(&self.template_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(PipelineError::Workspace(format!(
                "template project not found at {}",
                self.template_dir.display()
            )));
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| PipelineError::workspace("create workspace root", e))?;

        let path = self.workspace_dir(job_id);
        if tokio::fs::symlink_metadata(&path).await.is_ok() {
            tracing::warn!(path = %path.display(), "Removing stale workspace");
            remove_workspace_dir(&path, &self.cache_name).await?;
        }

        let mut skip: Vec<String> = SKIPPED_ENTRIES.iter().map(|s| s.to_string()).collect();
        skip.push(self.cache_name.clone());
        let (src, dst) = (self.template_dir.clone(), path.clone());
        let copied = tokio::task::spawn_blocking(move || copy_tree(&src, &dst, &skip))
            .await
            .map_err(|e| PipelineError::workspace("copy task panicked", e))?
            .map_err(|e| PipelineError::workspace("copy template", e))?;
        tracing::debug!(job_id = %job_id, files = copied, "Template copied");

        let cache_source = self.template_dir.join(&self.cache_name);
        let cache_link = if tokio::fs::metadata(&cache_source).await.is_ok() {
            let link = path.join(&self.cache_name);
            tokio::fs::symlink(&cache_source, &link)
                .await
                .map_err(|e| PipelineError::workspace("link dependency cache", e))?;
            Some(link)
        } else {
            tracing::warn!(
                cache = %cache_source.display(),
                "Dependency cache missing from template, workspace will have none"
            );
            None
        };

        for dir in ["out", "public"] {
            tokio::fs::create_dir_all(path.join(dir))
                .await
                .map_err(|e| PipelineError::workspace(&format!("create {}/", dir), e))?;
        }

        Ok(Workspace {
            job_id,
            path,
            cache_link,
        })
    }

    /// Remove a workspace. Best-effort: problems are logged, never returned,
    /// and a workspace that is already gone is not an error.
    pub async fn destroy(&self, workspace: Workspace) {
        if let Some(link) = &workspace.cache_link {
            if let Err(e) = tokio::fs::remove_file(link).await {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(link = %link.display(), error = %e, "Failed to unlink dependency cache");
                }
            }
        }
        if let Err(e) = remove_workspace_dir(&workspace.path, &self.cache_name).await {
            tracing::warn!(path = %workspace.path.display(), error = %e, "Failed to remove workspace");
        } else {
            tracing::debug!(path = %workspace.path.display(), "Workspace removed");
        }
        self.release(workspace.job_id);
    }

    /// Apply the retention policy to a workspace whose job has finished.
    pub async fn finalize(&self, workspace: Workspace, succeeded: bool) {
        match self.retention {
            Retention::DeleteOnSuccess if succeeded => self.destroy(workspace).await,
            Retention::DeleteOnSuccess => {
                tracing::info!(
                    job_id = %workspace.job_id,
                    path = %workspace.path.display(),
                    "Keeping workspace of failed job for inspection"
                );
                self.release(workspace.job_id);
            }
            Retention::KeepLast(keep) => {
                self.release(workspace.job_id);
                self.prune(keep).await;
            }
        }
    }

    /// Delete all but the newest `keep` finished workspaces.
    async fn prune(&self, keep: usize) {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "Cannot list workspaces");
                return;
            }
        };

        let mut finished = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(WORKSPACE_PREFIX) || self.is_active(&name) {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            finished.push((modified, entry.path()));
        }

        finished.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, path) in finished.into_iter().skip(keep) {
            match remove_workspace_dir(&path, &self.cache_name).await {
                Ok(()) => tracing::debug!(path = %path.display(), "Pruned old workspace"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to prune workspace"),
            }
        }
    }
}

async fn remove_workspace_dir(path: &Path, cache_name: &str) -> PipelineResult<()> {
    let _ = tokio::fs::remove_file(path.join(cache_name)).await;
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::workspace(&format!("remove {}", path.display()), e)),
    }
}

/// Recursive copy that keeps symlinks as symlinks and skips the named
/// top-level entries.
fn copy_tree(src: &Path, dst: &Path, skip: &[String]) -> io::Result<u64> {
    std::fs::create_dir_all(dst)?;
    let mut copied = 0;

    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() != 1 || !skip.iter().any(|s| e.file_name() == s.as_str()));

    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}
