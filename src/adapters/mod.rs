//! Capability adapters around external scraping and LLM services.
//!
//! Each capability is a trait so the pipeline can run against real providers
//! or in-process fakes. [`AdapterSet`] wraps every call with the shared
//! policy: bounded attempts for adapter/schema failures, schema validation of
//! LLM output, and cancellation from the owning job.

mod analyst;
mod planner;
pub mod schema;
mod scraper;

pub use analyst::LlmAnalyst;
pub use planner::LlmPlanner;
pub use schema::{Analysis, DirectorOutput, PageData, Plan, Storyboard, Validate};
pub use scraper::{BrowserUseScraper, FallbackScraper, FirecrawlScraper};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, PipelineResult};
use crate::job::RenderMode;

#[async_trait]
pub trait Scraper: Send + Sync {
    /// Provider name used in logs and `PageData::source`.
    fn name(&self) -> &str;

    async fn scrape(&self, url: &str) -> PipelineResult<PageData>;
}

#[async_trait]
pub trait Analyst: Send + Sync {
    async fn analyze(&self, page: &PageData) -> PipelineResult<Analysis>;
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Templated mode yields [`Plan::Director`], agentic mode [`Plan::Storyboard`].
    async fn plan(&self, page: &PageData, analysis: &Analysis, mode: RenderMode) -> PipelineResult<Plan>;
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct AttemptPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for AttemptPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl AttemptPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(10)))
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts, or `cancel` fires.
    pub async fn run<T, F, Fut>(&self, label: &str, cancel: &CancellationToken, mut op: F) -> PipelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                result = op() => result,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(call = %label, attempts = attempt + 1, "Adapter call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            attempt += 1;
            if !error.is_retryable() || attempt >= self.max_attempts {
                if error.is_retryable() {
                    tracing::error!(call = %label, attempts = attempt, error = %error, "Adapter call exhausted its attempts");
                }
                return Err(error);
            }

            let delay = self.delay(attempt - 1);
            tracing::warn!(
                call = %label,
                attempt,
                kind = error.kind(),
                "Adapter call failed, retrying in {:?}: {}",
                delay,
                error
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

pub(crate) fn cancelled() -> PipelineError {
    PipelineError::Cancelled("cancelled by request".to_string())
}

/// The adapters one pipeline uses, plus the retry policy applied to them.
#[derive(Clone)]
pub struct AdapterSet {
    pub scraper: Arc<dyn Scraper>,
    pub analyst: Arc<dyn Analyst>,
    pub planner: Arc<dyn Planner>,
    pub policy: AttemptPolicy,
}

impl AdapterSet {
    pub fn new(
        scraper: Arc<dyn Scraper>,
        analyst: Arc<dyn Analyst>,
        planner: Arc<dyn Planner>,
        policy: AttemptPolicy,
    ) -> Self {
        Self {
            scraper,
            analyst,
            planner,
            policy,
        }
    }

    pub async fn scrape(&self, url: &str, cancel: &CancellationToken) -> PipelineResult<PageData> {
        let scraper = Arc::clone(&self.scraper);
        self.policy
            .run("scrape", cancel, || {
                let scraper = Arc::clone(&scraper);
                async move { scraper.scrape(url).await }
            })
            .await
    }

    pub async fn analyze(&self, page: &PageData, cancel: &CancellationToken) -> PipelineResult<Analysis> {
        let analyst = Arc::clone(&self.analyst);
        self.policy
            .run("analyze", cancel, || {
                let analyst = Arc::clone(&analyst);
                async move {
                    let analysis = analyst.analyze(page).await?;
                    analysis.validate()?;
                    Ok(analysis)
                }
            })
            .await
    }

    pub async fn plan(
        &self,
        page: &PageData,
        analysis: &Analysis,
        mode: RenderMode,
        cancel: &CancellationToken,
    ) -> PipelineResult<Plan> {
        let planner = Arc::clone(&self.planner);
        self.policy
            .run("plan", cancel, || {
                let planner = Arc::clone(&planner);
                async move {
                    let plan = planner.plan(page, analysis, mode).await?;
                    if plan.mode() != mode {
                        return Err(PipelineError::Schema(format!(
                            "planner returned a {} plan for a {} job",
                            plan.mode(),
                            mode
                        )));
                    }
                    plan.validate()?;
                    Ok(plan)
                }
            })
            .await
    }
}
