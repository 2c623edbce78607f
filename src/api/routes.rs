//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::PipelineError;
use crate::job::{JobView, RenderMode};
use crate::orchestrator::{CancelOutcome, Orchestrator};
use crate::pipeline::{build_adapters, Pipeline};
use crate::store::{JobStore, SharedJobStore};

use super::outputs;
use super::types::*;

/// How long running jobs get to record their cancellation on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared application state.
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
    pub store: SharedJobStore,
}

impl AppState {
    pub fn new(config: Arc<Config>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            store: Arc::clone(orchestrator.store()),
            config,
            orchestrator,
        }
    }
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    tokio::fs::create_dir_all(&config.outputs_dir).await?;
    let store = Arc::new(JobStore::open(config.jobs_file()).await);
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&config),
        Arc::clone(&store),
        build_adapters(&config),
    ));
    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&config), pipeline));
    let state = Arc::new(AppState::new(Arc::clone(&config), orchestrator));

    let app = build_router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        render_mode = %config.render_mode,
        template = %config.template_dir.display(),
        "Server listening on {}",
        addr
    );

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_state).await;
        })
        .await?;

    Ok(())
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/status/:id", get(get_status))
        .route("/status/:id/stream", get(stream_status))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/outputs/:file", get(outputs::download))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wait for SIGINT/SIGTERM, then stop every running job and flush the store.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, cancelling running jobs...");
    state.orchestrator.shutdown(SHUTDOWN_GRACE).await;
}

fn error_response(err: PipelineError) -> (StatusCode, String) {
    let status = match &err {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        render_mode: state.config.render_mode,
        jobs: state.store.counts().await,
    })
}

async fn generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, (StatusCode, String)> {
    let mode = match req.mode.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        Some(raw) => Some(
            raw.parse::<RenderMode>()
                .map_err(|e| (StatusCode::BAD_REQUEST, e))?,
        ),
        None => None,
    };

    let view = state
        .orchestrator
        .submit(&req.url, mode)
        .await
        .map_err(error_response)?;

    Ok(Json(GenerateResponse {
        job_id: view.job_id,
        status: view.status,
        mode: view.mode,
        message: "Video generation started".to_string(),
    }))
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, (StatusCode, String)> {
    let job = state.store.get_by_str(&id).await.map_err(error_response)?;
    Ok(Json(job.view()))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobView>> {
    let jobs = state.store.list().await;
    Json(jobs.iter().map(|job| job.view()).collect())
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    let job = state.store.get_by_str(&id).await.map_err(error_response)?;
    match state.orchestrator.cancel(job.id).await.map_err(error_response)? {
        CancelOutcome::Requested => Ok(Json(CancelResponse {
            job_id: job.id,
            message: "Cancellation requested".to_string(),
        })),
        CancelOutcome::AlreadyFinished => Err((
            StatusCode::CONFLICT,
            format!("Job {} has already finished", job.id),
        )),
    }
}

/// Server-Sent Events: a `status` event per change of the job, then `done`.
async fn stream_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    // Subscribe before the snapshot so no update falls in between.
    let mut updates = state.store.subscribe();
    let job = state.store.get_by_str(&id).await.map_err(error_response)?;
    let store = Arc::clone(&state.store);

    let stream = async_stream::stream! {
        let mut current = job;
        let mut last_sent: Option<JobView> = None;

        loop {
            let view = current.view();
            if last_sent.as_ref() != Some(&view) {
                if let Ok(event) = Event::default().event("status").json_data(&view) {
                    yield Ok(event);
                }
                last_sent = Some(view);
            }

            if current.status.is_terminal() {
                let done = serde_json::json!({
                    "status": current.status,
                    "output_path": current.output_path,
                    "error_message": current.error_message,
                });
                if let Ok(event) = Event::default().event("done").json_data(done) {
                    yield Ok(event);
                }
                break;
            }

            let next = loop {
                match updates.recv().await {
                    Ok(job) if job.id == current.id => break Some(job),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(job_id = %current.id, skipped, "Status stream lagged, re-reading job");
                        break store.get(current.id).await.ok();
                    }
                    Err(RecvError::Closed) => break None,
                }
            };
            match next {
                Some(job) => current = job,
                None => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
