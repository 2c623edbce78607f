//! The stage pipeline: one job from URL to published video.
//!
//! ```text
//! templated: scraping → analyzing → generating → rendering
//! agentic:   scraping → analyzing → storyboarding → generating → rendering
//! ```
//!
//! [`JobProgress`] is the only writer of a running job's record. Every stage
//! change goes through it, is checked against the mode's stage order and is
//! persisted before the stage's work begins. Any error ends the job as
//! `failed` with the stage it happened in.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapters::{
    cancelled, AdapterSet, Analysis, AttemptPolicy, BrowserUseScraper, FallbackScraper, FirecrawlScraper,
    LlmAnalyst, LlmPlanner, PageData, Plan, Scraper,
};
use crate::assets::AssetFetcher;
use crate::audio::{self, AudioManifest, ElevenLabsClient, VoiceSynth};
use crate::brief::{self, BriefContext};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::job::{is_valid_stage_transition, Job, JobStatus, RenderMode, Stage};
use crate::llm::{LlmClient, OpenAiClient};
use crate::sandbox::{locate_artifact, CommandGenerator, Generator, RemotionRenderer, Renderer, PROPS_PATH};
use crate::store::SharedJobStore;
use crate::workspace::{Retention, Workspace, WorkspaceManager};

const GENERATOR_LOG: &str = "generator.log";
const HOOK_PREVIEW_CHARS: usize = 60;

/// Sole writer of one job's record while the pipeline owns it.
pub struct JobProgress {
    store: SharedJobStore,
    job: Job,
    cancel: CancellationToken,
}

impl JobProgress {
    pub fn new(store: SharedJobStore, job: Job, cancel: CancellationToken) -> Self {
        Self { store, job, cancel }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    async fn publish(&mut self) {
        self.store.upsert(self.job.clone()).await;
    }

    async fn start(&mut self) -> PipelineResult<()> {
        if !self.job.status.can_transition_to(JobStatus::Running) {
            return Err(PipelineError::Validation(format!(
                "job {} is {:?} and cannot start",
                self.job.id, self.job.status
            )));
        }
        self.job.status = JobStatus::Running;
        self.job.stage_detail = "Starting...".to_string();
        self.publish().await;
        Ok(())
    }

    /// Enter `stage`. Fails if cancellation was requested or if `stage` does
    /// not directly follow the current one.
    pub async fn advance(&mut self, stage: Stage, detail: &str) -> PipelineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }
        if !is_valid_stage_transition(self.job.mode, self.job.stage, stage) {
            return Err(PipelineError::Validation(format!(
                "invalid stage transition {:?} -> {} for {} mode",
                self.job.stage, stage, self.job.mode
            )));
        }
        tracing::info!(job_id = %self.job.id, stage = %stage, "Stage started");
        self.job.stage = Some(stage);
        self.job.stage_detail = detail.to_string();
        self.publish().await;
        Ok(())
    }

    pub async fn detail(&mut self, detail: impl Into<String>) {
        self.job.stage_detail = detail.into();
        self.publish().await;
    }

    pub async fn complete(&mut self, output_path: String) {
        self.job.status = JobStatus::Completed;
        self.job.stage_detail = "Video ready!".to_string();
        self.job.output_path = Some(output_path);
        self.job.error_message = None;
        self.publish().await;
        tracing::info!(job_id = %self.job.id, output = ?self.job.output_path, "Job completed");
    }

    pub async fn fail(&mut self, error: &PipelineError) {
        let message = match (error, self.job.stage) {
            (PipelineError::Cancelled(reason), _) => reason.clone(),
            (_, Some(stage)) => format!("{} failed: {}", stage, error),
            (_, None) => error.to_string(),
        };
        self.job.status = JobStatus::Failed;
        self.job.stage_detail = format!("Error: {}", message);
        self.job.error_message = Some(message);
        self.job.output_path = None;
        self.publish().await;
        tracing::error!(
            job_id = %self.job.id,
            stage = ?self.job.stage,
            kind = error.kind(),
            "Job failed: {}",
            error
        );
    }

    pub fn into_job(self) -> Job {
        self.job
    }
}

/// Everything one job needs while it runs.
struct JobContext<'a> {
    job_id: Uuid,
    url: String,
    data_dir: PathBuf,
    cancel: &'a CancellationToken,
}

impl JobContext<'_> {
    fn output_name(&self) -> String {
        crate::job::output_file_name(self.job_id)
    }

    fn log_path(&self) -> PathBuf {
        self.data_dir.join(GENERATOR_LOG)
    }

    /// Keep an intermediate for later inspection; losing one is not fatal.
    async fn persist<T: Serialize>(&self, name: &str, value: &T) {
        let path = self.data_dir.join(name);
        let result = match serde_json::to_vec_pretty(value) {
            Ok(bytes) => tokio::fs::write(&path, bytes).await,
            Err(e) => Err(std::io::Error::other(e)),
        };
        if let Err(e) = result {
            tracing::warn!(job_id = %self.job_id, path = %path.display(), error = %e, "Failed to save intermediate");
        }
    }
}

pub struct Pipeline {
    config: Arc<Config>,
    store: SharedJobStore,
    adapters: AdapterSet,
    workspaces: Arc<WorkspaceManager>,
    generator: Arc<dyn Generator>,
    renderer: Arc<dyn Renderer>,
    assets: Arc<AssetFetcher>,
    voice: Option<Arc<dyn VoiceSynth>>,
}

impl Pipeline {
    /// Pipeline with the external tools named in `config`.
    pub fn new(config: Arc<Config>, store: SharedJobStore, adapters: AdapterSet) -> Self {
        let workspaces = Arc::new(WorkspaceManager::new(
            config.workspaces_dir.clone(),
            config.template_dir.clone(),
            config.dependency_cache.clone(),
            Retention::from(config.workspace_keep_last),
        ));
        let voice = config.providers.elevenlabs_api_key.clone().map(|key| {
            Arc::new(ElevenLabsClient::new(key, config.providers.elevenlabs_voice_id.clone())) as Arc<dyn VoiceSynth>
        });
        Self {
            generator: Arc::new(CommandGenerator::new(config.generator_program.clone())),
            renderer: Arc::new(RemotionRenderer::new(config.render_program.clone())),
            assets: Arc::new(AssetFetcher::new()),
            workspaces,
            voice,
            config,
            store,
            adapters,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_voice(mut self, voice: Option<Arc<dyn VoiceSynth>>) -> Self {
        self.voice = voice;
        self
    }

    pub fn store(&self) -> &SharedJobStore {
        &self.store
    }

    /// Drive job `job_id` from `queued` to a terminal state and return the
    /// final record. Only returns `Err` if the job does not exist.
    pub async fn run(&self, job_id: Uuid, cancel: CancellationToken) -> PipelineResult<Job> {
        let job = self.store.get(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        let ctx = JobContext {
            job_id,
            url: job.source_url.clone(),
            data_dir: self.config.job_data_dir(job_id),
            cancel: &cancel,
        };
        let mut progress = JobProgress::new(Arc::clone(&self.store), job, cancel.clone());
        if let Err(e) = progress.start().await {
            tracing::warn!(job_id = %job_id, "Not starting job: {}", e);
            return Ok(progress.into_job());
        }

        if let Err(e) = tokio::fs::create_dir_all(&ctx.data_dir).await {
            tracing::warn!(job_id = %job_id, error = %e, "Cannot create job data directory");
        }

        let mut workspace = None;
        let result = self.execute(&mut progress, &ctx, &mut workspace).await;
        let succeeded = result.is_ok();
        match result {
            Ok(output_path) => progress.complete(output_path).await,
            Err(e) => progress.fail(&e).await,
        }

        if let Some(ws) = workspace {
            self.workspaces.finalize(ws, succeeded).await;
        }
        Ok(progress.into_job())
    }

    async fn execute(
        &self,
        progress: &mut JobProgress,
        ctx: &JobContext<'_>,
        workspace: &mut Option<Workspace>,
    ) -> PipelineResult<String> {
        progress.advance(Stage::Scraping, "Scraping website content...").await?;
        let page = self.adapters.scrape(&ctx.url, ctx.cancel).await?;
        ctx.persist("page.json", &page).await;
        progress.detail(format!("Scraped '{}'", page.title)).await;

        progress.advance(Stage::Analyzing, "Analyzing product...").await?;
        let analysis = self.adapters.analyze(&page, ctx.cancel).await?;
        ctx.persist("analysis.json", &analysis).await;
        progress
            .detail(format!("Hook: {}...", preview(&analysis.hook, HOOK_PREVIEW_CHARS)))
            .await;

        let mode = progress.job().mode;
        match mode {
            RenderMode::Templated => self.run_templated(progress, ctx, &page, &analysis, workspace).await,
            RenderMode::Agentic => self.run_agentic(progress, ctx, &page, &analysis, workspace).await,
        }
    }

    async fn run_templated(
        &self,
        progress: &mut JobProgress,
        ctx: &JobContext<'_>,
        page: &PageData,
        analysis: &Analysis,
        slot: &mut Option<Workspace>,
    ) -> PipelineResult<String> {
        progress.advance(Stage::Generating, "Designing video...").await?;
        let plan = self
            .adapters
            .plan(page, analysis, RenderMode::Templated, ctx.cancel)
            .await?;
        ctx.persist("plan.json", &plan).await;
        let Plan::Director(mut director) = plan else {
            return Err(PipelineError::Schema("expected a director plan".to_string()));
        };

        progress.detail("Preparing workspace...").await;
        let workspace = slot.insert(self.workspaces.create(ctx.job_id).await?);
        unless_cancelled(
            ctx.cancel,
            self.assets.localize_director_assets(&mut director, &workspace.public_dir()),
        )
        .await??;
        write_props(workspace.path(), &brief::props_document(&director)).await?;
        progress
            .detail(format!("Props ready for '{}'", director.product.name))
            .await;

        progress.advance(Stage::Rendering, "Rendering video...").await?;
        let output_name = ctx.output_name();
        let log_path = ctx.log_path();
        self.renderer
            .render(workspace, &output_name, self.config.render_timeout, ctx.cancel, Some(&log_path))
            .await?
            .into_result("renderer")?;

        let artifact = locate_artifact(&workspace.out_dir(), &output_name).await?;
        self.publish(&artifact, &output_name).await
    }

    async fn run_agentic(
        &self,
        progress: &mut JobProgress,
        ctx: &JobContext<'_>,
        page: &PageData,
        analysis: &Analysis,
        slot: &mut Option<Workspace>,
    ) -> PipelineResult<String> {
        progress.advance(Stage::Storyboarding, "Designing storyboard...").await?;
        let plan = self
            .adapters
            .plan(page, analysis, RenderMode::Agentic, ctx.cancel)
            .await?;
        ctx.persist("plan.json", &plan).await;
        let Plan::Storyboard(storyboard) = plan else {
            return Err(PipelineError::Schema("expected a storyboard plan".to_string()));
        };
        progress
            .detail(format!(
                "{} scenes, {}s video",
                storyboard.scenes.len(),
                storyboard.total_duration_seconds
            ))
            .await;

        progress.advance(Stage::Generating, "Preparing workspace...").await?;
        let workspace = slot.insert(self.workspaces.create(ctx.job_id).await?);
        let public_dir = workspace.public_dir();
        let images = unless_cancelled(
            ctx.cancel,
            self.assets.download_all(&storyboard.image_urls, &public_dir),
        )
        .await??;
        let audio = unless_cancelled(ctx.cancel, self.prepare_audio(&storyboard, &public_dir)).await?;

        let output_name = ctx.output_name();
        let brief = brief::compile(
            &storyboard,
            &BriefContext {
                output_name: &output_name,
                images: &images,
                audio: Some(&audio),
            },
        );

        progress.detail("Generating video code...").await;
        let log_path = ctx.log_path();
        self.generator
            .run(workspace, &brief, self.config.generation_timeout, ctx.cancel, Some(&log_path))
            .await?
            .into_result("generator")?;

        progress.advance(Stage::Rendering, "Collecting rendered video...").await?;
        let artifact = locate_artifact(&workspace.out_dir(), &output_name).await?;
        self.publish(&artifact, &output_name).await
    }

    async fn prepare_audio(&self, storyboard: &crate::adapters::Storyboard, public_dir: &Path) -> AudioManifest {
        let voiceovers = match &self.voice {
            Some(voice) => audio::generate_voiceovers(voice.as_ref(), storyboard, public_dir).await,
            None => Vec::new(),
        };
        let music = audio::prepare_background_music(
            self.config.providers.music_dir.as_deref(),
            &storyboard.background_music_style,
            public_dir,
        )
        .await;
        AudioManifest { voiceovers, music }
    }

    /// Copy the artifact out of the workspace and return its public path.
    async fn publish(&self, artifact: &Path, output_name: &str) -> PipelineResult<String> {
        tokio::fs::create_dir_all(&self.config.outputs_dir)
            .await
            .map_err(|e| PipelineError::workspace("create outputs directory", e))?;
        let dest = self.config.outputs_dir.join(output_name);
        tokio::fs::copy(artifact, &dest)
            .await
            .map_err(|e| PipelineError::workspace(&format!("publish {}", artifact.display()), e))?;
        Ok(format!("/outputs/{}", output_name))
    }
}

/// Drop `work` as soon as the job is cancelled.
async fn unless_cancelled<T>(cancel: &CancellationToken, work: impl Future<Output = T>) -> PipelineResult<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(cancelled()),
        value = work => Ok(value),
    }
}

async fn write_props(workspace: &Path, props: &serde_json::Value) -> PipelineResult<()> {
    let path = workspace.join(PROPS_PATH);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::workspace("create props directory", e))?;
    }
    let bytes = serde_json::to_vec_pretty(props).map_err(|e| PipelineError::workspace("encode props", e))?;
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| PipelineError::workspace(&format!("write {}", path.display()), e))
}

fn preview(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Adapters backed by the providers named in `config`.
pub fn build_adapters(config: &Config) -> AdapterSet {
    let providers = &config.providers;

    let primary = providers.firecrawl_api_key.clone().map(|key| {
        Arc::new(FirecrawlScraper::new(key, providers.firecrawl_endpoint.clone())) as Arc<dyn Scraper>
    });
    let fallback = match (&providers.browser_use_api_key, &providers.browser_use_endpoint) {
        (Some(key), Some(endpoint)) => {
            Some(Arc::new(BrowserUseScraper::new(key.clone(), endpoint.clone())) as Arc<dyn Scraper>)
        }
        _ => None,
    };
    if primary.is_none() && fallback.is_none() {
        tracing::warn!("No scraping provider configured, every job will fail at scraping");
    }

    if providers.openai_api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set, analysis and planning will fail");
    }
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(
        providers.openai_api_key.clone().unwrap_or_default(),
        &providers.openai_base_url,
    ));

    AdapterSet::new(
        Arc::new(FallbackScraper::new(primary, fallback)),
        Arc::new(LlmAnalyst::new(Arc::clone(&llm), providers.llm_model.clone())),
        Arc::new(LlmPlanner::new(llm, providers.llm_model.clone())),
        AttemptPolicy::with_max_attempts(config.adapter_max_attempts),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobStore;

    fn progress(mode: RenderMode) -> JobProgress {
        let store = Arc::new(JobStore::in_memory());
        let mut job = Job::new("https://bolt.dev", mode);
        job.status = JobStatus::Running;
        JobProgress::new(store, job, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_stages_must_follow_mode_order() {
        let mut p = progress(RenderMode::Templated);
        assert!(p.advance(Stage::Analyzing, "").await.is_err());
        p.advance(Stage::Scraping, "").await.unwrap();
        p.advance(Stage::Analyzing, "").await.unwrap();
        assert!(p.advance(Stage::Storyboarding, "").await.is_err());
        p.advance(Stage::Generating, "").await.unwrap();
        assert!(p.advance(Stage::Generating, "").await.is_err());
    }

    #[tokio::test]
    async fn test_advance_refuses_after_cancellation() {
        let mut p = progress(RenderMode::Agentic);
        p.cancel.cancel();
        assert!(matches!(p.advance(Stage::Scraping, "").await, Err(PipelineError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_failure_message_names_stage() {
        let mut p = progress(RenderMode::Templated);
        p.advance(Stage::Scraping, "").await.unwrap();
        p.fail(&PipelineError::Adapter("all providers failed".into())).await;

        let job = p.into_job();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("scraping failed: adapter error: all providers failed")
        );
        assert!(job.terminal_fields_consistent());
    }

    #[tokio::test]
    async fn test_progress_is_visible_in_store() {
        let mut p = progress(RenderMode::Templated);
        let store = Arc::clone(&p.store);
        let id = p.job().id;
        p.advance(Stage::Scraping, "Scraping website content...").await.unwrap();

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.stage, Some(Stage::Scraping));
        assert_eq!(stored.stage_detail, "Scraping website content...");
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("abcdef", 3), "abc");
        assert_eq!(preview("ab", 3), "ab");
    }
}
