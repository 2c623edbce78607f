//! Request and response bodies.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{JobStatus, RenderMode};
use crate::store::StatusCounts;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub url: String,
    /// `templated` or `agentic`; the server default when absent.
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub mode: RenderMode,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub render_mode: RenderMode,
    pub jobs: StatusCounts,
}
