//! End-to-end runs of the orchestrator with in-process adapters and shell
//! scripts standing in for the render and code-generation tools.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use promoreel::adapters::{
    AdapterSet, Analysis, Analyst, AttemptPolicy, DirectorOutput, FallbackScraper, PageData, Plan,
    Planner, Scraper, Storyboard,
};
use promoreel::audio::VoiceSynth;
use promoreel::orchestrator::CancelOutcome;
use promoreel::pipeline::Pipeline;
use promoreel::store::{JobStore, SharedJobStore};
use promoreel::{Config, Job, JobStatus, Orchestrator, PipelineError, PipelineResult, RenderMode, Stage};
use tempfile::TempDir;
use uuid::Uuid;

struct StaticScraper;

#[async_trait]
impl Scraper for StaticScraper {
    fn name(&self) -> &str {
        "static"
    }

    async fn scrape(&self, _url: &str) -> PipelineResult<PageData> {
        Ok(PageData {
            title: "Bolt".to_string(),
            tagline: "Dashboards at the speed of thought".to_string(),
            description: "Bolt renders analytics dashboards in milliseconds.".to_string(),
            source: "static".to_string(),
            ..Default::default()
        })
    }
}

struct DownScraper {
    calls: AtomicUsize,
}

#[async_trait]
impl Scraper for DownScraper {
    fn name(&self) -> &str {
        "down"
    }

    async fn scrape(&self, _url: &str) -> PipelineResult<PageData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::Adapter("provider unavailable".to_string()))
    }
}

struct HangingScraper;

#[async_trait]
impl Scraper for HangingScraper {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn scrape(&self, _url: &str) -> PipelineResult<PageData> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        StaticScraper.scrape("").await
    }
}

/// Takes seconds per clip, like a slow speech provider.
struct SlowVoice {
    started: AtomicBool,
}

#[async_trait]
impl VoiceSynth for SlowVoice {
    async fn synthesize(&self, _text: &str) -> anyhow::Result<bytes::Bytes> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(bytes::Bytes::from_static(b"ID3"))
    }
}

struct StaticAnalyst;

#[async_trait]
impl Analyst for StaticAnalyst {
    async fn analyze(&self, _page: &PageData) -> PipelineResult<Analysis> {
        Ok(Analysis {
            hook: "Dashboards that take minutes to load".to_string(),
            solution: "A columnar engine in the browser".to_string(),
            stack: "Rust, WebAssembly".to_string(),
        })
    }
}

struct StaticPlanner;

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _page: &PageData, _analysis: &Analysis, mode: RenderMode) -> PipelineResult<Plan> {
        Ok(match mode {
            RenderMode::Templated => Plan::Director(director()),
            RenderMode::Agentic => Plan::Storyboard(storyboard()),
        })
    }
}

fn director() -> DirectorOutput {
    serde_json::from_value(serde_json::json!({
        "product": {
            "name": "BOLT",
            "tagline": "Dashboards at the speed of thought",
            "logo": {"icon": "bolt", "primaryColor": "#1E88E5", "secondaryColor": "#42A5F5"}
        },
        "problem": {"line1": "Your dashboards are slow", "line2": "Every single time", "accentColor": "#FF5252"},
        "solution": {"headline": "Bolt renders in milliseconds", "subline": "No warehouse required"},
        "screenshots": [{"src": "", "callouts": [{"icon": "⚡", "text": "Instant queries"}]}],
        "outro": {"tagline": "Try Bolt today"},
        "theme": {"primary": "#1E88E5", "accent": "#FFC107", "background": "#0D1117", "text": "#FFFFFF"}
    }))
    .unwrap()
}

fn storyboard() -> Storyboard {
    let scene = |n: u32, name: &str| {
        serde_json::json!({
            "scene_number": n,
            "scene_name": name,
            "duration_seconds": 4.0,
            "headline_text": format!("{} headline", name),
            "visual_concept": format!("{} visual", name),
            "voiceover_script": format!("{} in a few words", name),
        })
    };
    serde_json::from_value(serde_json::json!({
        "product_name": "Bolt",
        "video_concept": "Speed lines everywhere.",
        "color_palette": ["#000000", "#FFFFFF", "#0066FF"],
        "total_duration_seconds": 12.0,
        "scenes": [scene(1, "Hook"), scene(2, "Solution"), scene(3, "CTA")],
        "closing_cta": "Try Bolt",
        "background_music_style": "none"
    }))
    .unwrap()
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Harness {
    dir: TempDir,
    config: Config,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template");
        std::fs::create_dir_all(template.join("src/scenes")).unwrap();
        std::fs::create_dir_all(template.join("node_modules/remotion")).unwrap();
        std::fs::write(template.join("package.json"), "{}").unwrap();
        std::fs::write(template.join("src/Root.tsx"), "export {};").unwrap();

        let tools = dir.path().join("bin");
        std::fs::create_dir_all(&tools).unwrap();
        // $4 is out/{name}
        let render = write_script(
            &tools,
            "fake-render",
            "test -f src/configs/signal.json || exit 4\nmkdir -p out\nprintf 'fake-mp4' > \"$4\"",
        );
        let generate = write_script(
            &tools,
            "fake-agent",
            "test -f TASK_BRIEF.md || exit 3\necho \"writing scenes\"\nmkdir -p out\nprintf 'fake-mp4' > out/promo.mp4",
        );

        let mut config = Config::from_lookup(|_| None).unwrap();
        config.data_dir = dir.path().join("data");
        config.outputs_dir = dir.path().join("outputs");
        config.workspaces_dir = dir.path().join("workspaces");
        config.template_dir = template;
        config.render_program = render.to_string_lossy().into_owned();
        config.generator_program = generate.to_string_lossy().into_owned();
        config.generation_timeout = Duration::from_secs(20);
        config.render_timeout = Duration::from_secs(20);

        Self { dir, config }
    }

    fn use_generator(&mut self, body: &str) {
        let path = write_script(&self.dir.path().join("bin"), "custom-agent", body);
        self.config.generator_program = path.to_string_lossy().into_owned();
    }

    fn orchestrator(&self, scraper: Arc<dyn Scraper>) -> (Orchestrator, SharedJobStore) {
        self.orchestrator_with_voice(scraper, None)
    }

    fn orchestrator_with_voice(
        &self,
        scraper: Arc<dyn Scraper>,
        voice: Option<Arc<dyn VoiceSynth>>,
    ) -> (Orchestrator, SharedJobStore) {
        let config = Arc::new(self.config.clone());
        let store: SharedJobStore = Arc::new(JobStore::in_memory());
        let adapters = AdapterSet::new(
            scraper,
            Arc::new(StaticAnalyst),
            Arc::new(StaticPlanner),
            AttemptPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
            },
        );
        let pipeline = Arc::new(Pipeline::new(Arc::clone(&config), Arc::clone(&store), adapters).with_voice(voice));
        (Orchestrator::new(config, pipeline), store)
    }

    fn workspace_path(&self, id: Uuid) -> PathBuf {
        self.config.workspaces_dir.join(format!("work-{}", id))
    }
}

async fn wait_terminal(store: &SharedJobStore, id: Uuid) -> Job {
    for _ in 0..500 {
        let job = store.get(id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} did not finish", id);
}

async fn wait_running(store: &SharedJobStore, id: Uuid) {
    for _ in 0..250 {
        if store.get(id).await.unwrap().status == JobStatus::Running {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never started", id);
}

/// Distinct stages seen for `id`, in order.
fn observed_stages(updates: &mut tokio::sync::broadcast::Receiver<Job>, id: Uuid) -> Vec<Stage> {
    let mut stages = Vec::new();
    while let Ok(job) = updates.try_recv() {
        if job.id != id {
            continue;
        }
        if let Some(stage) = job.stage {
            if stages.last() != Some(&stage) {
                stages.push(stage);
            }
        }
    }
    stages
}

#[tokio::test]
async fn test_templated_job_completes_through_every_stage() {
    let harness = Harness::new();
    let (orchestrator, store) = harness.orchestrator(Arc::new(StaticScraper));
    let mut updates = store.subscribe();

    let view = orchestrator
        .submit("https://example.com", Some(RenderMode::Templated))
        .await
        .unwrap();
    assert_eq!(view.status, JobStatus::Queued);

    let job = wait_terminal(&store, view.job_id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error_message);
    assert!(job.terminal_fields_consistent());

    let name = format!("video_{}.mp4", job.id);
    assert_eq!(job.output_path.as_deref(), Some(format!("/outputs/{}", name).as_str()));
    assert_eq!(std::fs::read(harness.config.outputs_dir.join(&name)).unwrap(), b"fake-mp4");

    assert_eq!(
        observed_stages(&mut updates, job.id),
        vec![Stage::Scraping, Stage::Analyzing, Stage::Generating, Stage::Rendering]
    );

    let data = harness.config.job_data_dir(job.id);
    assert!(data.join("page.json").exists());
    assert!(data.join("analysis.json").exists());
    assert!(data.join("plan.json").exists());
    assert!(!harness.workspace_path(job.id).exists(), "workspace removed on success");
}

#[tokio::test]
async fn test_agentic_job_runs_generator_with_brief() {
    let harness = Harness::new();
    let (orchestrator, store) = harness.orchestrator(Arc::new(StaticScraper));
    let mut updates = store.subscribe();

    let view = orchestrator
        .submit("https://example.com", Some(RenderMode::Agentic))
        .await
        .unwrap();
    let job = wait_terminal(&store, view.job_id).await;

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error_message);
    assert_eq!(
        observed_stages(&mut updates, job.id),
        vec![
            Stage::Scraping,
            Stage::Analyzing,
            Stage::Storyboarding,
            Stage::Generating,
            Stage::Rendering
        ]
    );

    // The agent wrote out/promo.mp4; it is published under the job's name.
    let published = harness.config.outputs_dir.join(format!("video_{}.mp4", job.id));
    assert!(published.exists());

    let log = std::fs::read_to_string(harness.config.job_data_dir(job.id).join("generator.log")).unwrap();
    assert!(log.contains("writing scenes"));
}

#[tokio::test]
async fn test_both_scrapers_failing_fails_at_scraping() {
    let harness = Harness::new();
    let primary = Arc::new(DownScraper { calls: AtomicUsize::new(0) });
    let fallback = Arc::new(DownScraper { calls: AtomicUsize::new(0) });
    let scraper = FallbackScraper::new(
        Some(Arc::clone(&primary) as Arc<dyn Scraper>),
        Some(Arc::clone(&fallback) as Arc<dyn Scraper>),
    );
    let (orchestrator, store) = harness.orchestrator(Arc::new(scraper));

    let view = orchestrator.submit("https://example.com", None).await.unwrap();
    let job = wait_terminal(&store, view.job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.stage, Some(Stage::Scraping));
    let message = job.error_message.as_deref().unwrap();
    assert!(message.starts_with("scraping failed"), "{}", message);
    assert!(job.output_path.is_none());
    assert!(primary.calls.load(Ordering::SeqCst) >= 1);
    assert!(fallback.calls.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_hung_generator_times_out_and_is_killed() {
    let mut harness = Harness::new();
    harness.use_generator("echo $$ > agent.pid\nexec sleep 30");
    harness.config.generation_timeout = Duration::from_secs(1);
    let (orchestrator, store) = harness.orchestrator(Arc::new(StaticScraper));

    let started = std::time::Instant::now();
    let view = orchestrator
        .submit("https://example.com", Some(RenderMode::Agentic))
        .await
        .unwrap();
    let job = wait_terminal(&store, view.job_id).await;

    assert!(started.elapsed() < Duration::from_secs(8));
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.stage, Some(Stage::Generating));
    assert!(job.error_message.as_deref().unwrap().contains("timed out after 1s"));

    // Timed-out workspaces are kept for inspection.
    let workspace = harness.workspace_path(job.id);
    assert!(workspace.join("TASK_BRIEF.md").exists());

    let pid = std::fs::read_to_string(workspace.join("agent.pid")).unwrap();
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid.trim())).unwrap_or_default();
    assert!(
        status.is_empty() || status.contains("State:\tZ"),
        "generator {} still alive",
        pid.trim()
    );
}

#[tokio::test]
async fn test_failing_generator_reports_log_tail() {
    let mut harness = Harness::new();
    harness.use_generator("echo 'compile error in Scene1.tsx' >&2\nexit 2");
    let (orchestrator, store) = harness.orchestrator(Arc::new(StaticScraper));

    let view = orchestrator
        .submit("https://example.com", Some(RenderMode::Agentic))
        .await
        .unwrap();
    let job = wait_terminal(&store, view.job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.unwrap();
    assert!(message.contains("exited with code 2"), "{}", message);
    assert!(message.contains("compile error in Scene1.tsx"), "{}", message);
}

#[tokio::test]
async fn test_start_is_idempotent_and_cancel_stops_job() {
    let harness = Harness::new();
    let (orchestrator, store) = harness.orchestrator(Arc::new(HangingScraper));

    let view = orchestrator.submit("https://example.com", None).await.unwrap();
    wait_running(&store, view.job_id).await;

    assert!(!orchestrator.start(view.job_id).await.unwrap());
    assert!(orchestrator.is_running(view.job_id).await);
    assert_eq!(orchestrator.running_count().await, 1);

    assert_eq!(orchestrator.cancel(view.job_id).await.unwrap(), CancelOutcome::Requested);
    let job = wait_terminal(&store, view.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("cancelled by request"));

    assert_eq!(
        orchestrator.cancel(view.job_id).await.unwrap(),
        CancelOutcome::AlreadyFinished
    );
}

#[tokio::test]
async fn test_cancel_interrupts_voiceover_synthesis() {
    let harness = Harness::new();
    let voice = Arc::new(SlowVoice {
        started: AtomicBool::new(false),
    });
    let (orchestrator, store) = harness.orchestrator_with_voice(
        Arc::new(StaticScraper),
        Some(Arc::clone(&voice) as Arc<dyn VoiceSynth>),
    );

    let view = orchestrator
        .submit("https://example.com", Some(RenderMode::Agentic))
        .await
        .unwrap();
    for _ in 0..250 {
        if voice.started.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(voice.started.load(Ordering::SeqCst), "voiceover never started");

    let cancelled_at = std::time::Instant::now();
    assert_eq!(orchestrator.cancel(view.job_id).await.unwrap(), CancelOutcome::Requested);
    let job = wait_terminal(&store, view.job_id).await;

    assert!(cancelled_at.elapsed() < Duration::from_secs(2), "took {:?}", cancelled_at.elapsed());
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.stage, Some(Stage::Generating));
    assert_eq!(job.error_message.as_deref(), Some("cancelled by request"));
    assert!(!harness.workspace_path(job.id).join("TASK_BRIEF.md").exists());
}

#[tokio::test]
async fn test_cancel_never_rewrites_a_finished_job() {
    let harness = Harness::new();
    let (orchestrator, store) = harness.orchestrator(Arc::new(StaticScraper));

    let mut done = Job::new("https://example.com/", RenderMode::Templated);
    done.status = JobStatus::Completed;
    done.output_path = Some(format!("/outputs/{}", done.output_file_name()));
    let done_id = done.id;
    store.upsert(done).await;
    assert_eq!(orchestrator.cancel(done_id).await.unwrap(), CancelOutcome::AlreadyFinished);
    assert_eq!(store.get(done_id).await.unwrap().status, JobStatus::Completed);

    // Hammer cancel while a real job finishes; the record must stay coherent.
    let view = orchestrator
        .submit("https://example.com", Some(RenderMode::Templated))
        .await
        .unwrap();
    loop {
        let job = store.get(view.job_id).await.unwrap();
        if job.status.is_terminal() {
            break;
        }
        if job.stage == Some(Stage::Rendering) {
            let _ = orchestrator.cancel(view.job_id).await.unwrap();
        }
        tokio::task::yield_now().await;
    }
    let job = wait_terminal(&store, view.job_id).await;
    assert!(job.terminal_fields_consistent());
    let published = harness.config.outputs_dir.join(format!("video_{}.mp4", job.id));
    assert_eq!(job.status == JobStatus::Completed, published.exists());
    assert_eq!(orchestrator.cancel(view.job_id).await.unwrap(), CancelOutcome::AlreadyFinished);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let harness = Harness::new();
    let (orchestrator, store) = harness.orchestrator(Arc::new(StaticScraper));
    let id = Uuid::new_v4();

    assert!(matches!(store.get(id).await, Err(PipelineError::NotFound(_))));
    assert!(matches!(orchestrator.start(id).await, Err(PipelineError::NotFound(_))));
    assert!(matches!(orchestrator.cancel(id).await, Err(PipelineError::NotFound(_))));
}

#[tokio::test]
async fn test_submission_rejects_private_hosts() {
    let harness = Harness::new();
    let (orchestrator, store) = harness.orchestrator(Arc::new(StaticScraper));

    let result = orchestrator.submit("http://127.0.0.1:8000/admin", None).await;
    assert!(matches!(result, Err(PipelineError::Validation(_))));
    assert!(store.list().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_cancels_running_jobs() {
    let harness = Harness::new();
    let (orchestrator, store) = harness.orchestrator(Arc::new(HangingScraper));

    let view = orchestrator.submit("https://example.com", None).await.unwrap();
    wait_running(&store, view.job_id).await;

    orchestrator.shutdown(Duration::from_secs(5)).await;
    assert_eq!(orchestrator.running_count().await, 0);
    let job = store.get(view.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.terminal_fields_consistent());
}
