//! Job intake and ownership.
//!
//! The orchestrator validates submissions, creates job records and hands
//! each queued job to exactly one background pipeline task. It keeps a
//! cancellation token per owned job; cancelling trips the token and the
//! pipeline winds itself down (killing any running subprocess).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::{Host, Url};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::job::{Job, JobStatus, JobView, RenderMode};
use crate::pipeline::Pipeline;
use crate::store::SharedJobStore;

const CANCEL_REASON: &str = "cancelled by request";
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was running or queued and is now being (or has been) stopped.
    Requested,
    /// The job had already reached a terminal state.
    AlreadyFinished,
}

pub struct Orchestrator {
    config: Arc<Config>,
    store: SharedJobStore,
    pipeline: Arc<Pipeline>,
    running: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            store: Arc::clone(pipeline.store()),
            config,
            pipeline,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &SharedJobStore {
        &self.store
    }

    /// Create a job for `url` and start it in the background. Returns the
    /// job as recorded, in `queued`, without waiting for any stage.
    pub async fn submit(&self, url: &str, mode: Option<RenderMode>) -> PipelineResult<JobView> {
        let url = validate_url(url)?;
        let mode = mode.unwrap_or(self.config.render_mode);
        let job = Job::new(url, mode);
        let id = job.id;
        let view = job.view();

        self.store.upsert(job).await;
        tracing::info!(job_id = %id, mode = %mode, "Job submitted");
        self.start(id).await?;

        Ok(view)
    }

    /// Hand a queued job to a pipeline task. Idempotent: returns `false`
    /// without doing anything if the job is already owned or not queued.
    pub async fn start(&self, id: Uuid) -> PipelineResult<bool> {
        let token = {
            let mut running = self.running.write().await;
            let job = self.store.get(id).await?;
            if job.status != JobStatus::Queued || running.contains_key(&id) {
                return Ok(false);
            }
            let token = CancellationToken::new();
            running.insert(id, token.clone());
            token
        };

        let pipeline = Arc::clone(&self.pipeline);
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            match pipeline.run(id, token).await {
                Ok(job) => tracing::debug!(job_id = %id, status = ?job.status, "Pipeline task finished"),
                Err(e) => tracing::error!(job_id = %id, "Pipeline task could not run: {}", e),
            }
            running.write().await.remove(&id);
        });

        Ok(true)
    }

    /// Request cancellation of a job.
    pub async fn cancel(&self, id: Uuid) -> PipelineResult<CancelOutcome> {
        // A pipeline task writes its terminal state before it gives up
        // ownership here, so under this lock "unowned" means nobody else
        // will write the record.
        let running = self.running.write().await;
        let mut job = self.store.get(id).await?;
        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished);
        }

        if let Some(token) = running.get(&id) {
            tracing::info!(job_id = %id, "Cancellation requested");
            token.cancel();
            return Ok(CancelOutcome::Requested);
        }

        if !job.status.can_transition_to(JobStatus::Failed) {
            return Ok(CancelOutcome::AlreadyFinished);
        }
        job.status = JobStatus::Failed;
        job.error_message = Some(CANCEL_REASON.to_string());
        job.stage_detail = format!("Error: {}", CANCEL_REASON);
        self.store.upsert(job).await;
        tracing::info!(job_id = %id, "Cancelled unowned job");
        Ok(CancelOutcome::Requested)
    }

    pub async fn is_running(&self, id: Uuid) -> bool {
        self.running.read().await.contains_key(&id)
    }

    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    /// Cancel every owned job, wait up to `grace` for the pipeline tasks to
    /// record their terminal states, then flush the store.
    pub async fn shutdown(&self, grace: Duration) {
        let tokens: Vec<_> = self.running.read().await.values().cloned().collect();
        if !tokens.is_empty() {
            tracing::info!(jobs = tokens.len(), "Cancelling running jobs for shutdown");
        }
        for token in &tokens {
            token.cancel();
        }

        let deadline = tokio::time::Instant::now() + grace;
        while self.running_count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        let left = self.running_count().await;
        if left > 0 {
            tracing::warn!(jobs = left, "Jobs still running at shutdown");
        }

        if let Err(e) = self.store.save_to_disk().await {
            tracing::error!("Failed to save jobs on shutdown: {}", e);
        }
    }
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified() || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().map_or(false, |v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}

/// False for URLs without a host or whose host is loopback, private,
/// link-local or a `localhost` name.
pub(crate) fn is_public_host(url: &Url) -> bool {
    match url.host() {
        None => false,
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain != "localhost" && !domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => !is_private_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => !is_private_ip(IpAddr::V6(ip)),
    }
}

/// Accept only absolute http(s) URLs that point at a public host.
pub fn validate_url(raw: &str) -> PipelineResult<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(PipelineError::Validation("url is required".to_string()));
    }

    let url = Url::parse(raw).map_err(|e| PipelineError::Validation(format!("'{}' is not a valid URL: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PipelineError::Validation(format!(
            "unsupported URL scheme '{}', expected http or https",
            url.scheme()
        )));
    }

    if url.host().is_none() {
        return Err(PipelineError::Validation("URL has no host".to_string()));
    }
    if !is_public_host(&url) {
        return Err(PipelineError::Validation(
            "URL must point at a public host".to_string(),
        ));
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url_accepts_public_http() {
        assert_eq!(tokio_test::assert_ok!(validate_url(" https://bolt.dev ")), "https://bolt.dev/");
        assert_eq!(
            tokio_test::assert_ok!(validate_url("http://93.184.216.34/page")),
            "http://93.184.216.34/page"
        );
    }

    #[test]
    fn test_validate_url_rejects() {
        for bad in [
            "",
            "bolt.dev",
            "ftp://bolt.dev/file",
            "file:///etc/passwd",
            "http://localhost:3000",
            "http://api.localhost",
            "http://127.0.0.1/",
            "http://10.1.2.3/",
            "http://192.168.0.10/",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/",
            "http://[fd00::1]/",
        ] {
            assert!(
                matches!(validate_url(bad), Err(PipelineError::Validation(_))),
                "{} should be rejected",
                bad
            );
        }
    }
}
