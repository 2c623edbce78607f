//! Job record, status and stage types.
//!
//! A [`Job`] moves `queued → running → {completed | failed}`. While running it
//! walks the stage list in order; templated jobs never enter
//! [`Stage::Storyboarding`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution mode, fixed at submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Fixed-schema director output filled into the template project.
    Templated,
    /// Open-ended storyboard implemented by the code-generation tool.
    Agentic,
}

impl Default for RenderMode {
    fn default() -> Self {
        Self::Templated
    }
}

impl RenderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Templated => "templated",
            Self::Agentic => "agentic",
        }
    }

    /// Stages a job in this mode passes through, in order.
    pub fn stages(&self) -> &'static [Stage] {
        match self {
            Self::Templated => &[
                Stage::Scraping,
                Stage::Analyzing,
                Stage::Generating,
                Stage::Rendering,
            ],
            Self::Agentic => &[
                Stage::Scraping,
                Stage::Analyzing,
                Stage::Storyboarding,
                Stage::Generating,
                Stage::Rendering,
            ],
        }
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "templated" => Ok(Self::Templated),
            "agentic" => Ok(Self::Agentic),
            other => Err(format!("unknown render mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Status only moves forward; terminal states are final.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scraping,
    Analyzing,
    Storyboarding,
    Generating,
    Rendering,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scraping => "scraping",
            Self::Analyzing => "analyzing",
            Self::Storyboarding => "storyboarding",
            Self::Generating => "generating",
            Self::Rendering => "rendering",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `next` is the stage that directly follows `current` in `mode`.
///
/// `current == None` means the job has not entered any stage yet.
pub fn is_valid_stage_transition(mode: RenderMode, current: Option<Stage>, next: Stage) -> bool {
    let stages = mode.stages();
    match current {
        None => stages.first() == Some(&next),
        Some(cur) => stages
            .iter()
            .position(|s| *s == cur)
            .and_then(|i| stages.get(i + 1))
            .map_or(false, |s| *s == next),
    }
}

/// The unit of work: one URL turned into one video.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub source_url: String,
    pub mode: RenderMode,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub stage_detail: String,
    /// Server-assigned path of the published artifact; set only on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    /// Set only on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(source_url: impl Into<String>, mode: RenderMode) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_url: source_url.into(),
            mode,
            status: JobStatus::Queued,
            stage: None,
            stage_detail: "Waiting to start...".to_string(),
            output_path: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// File name of the artifact this job publishes.
    pub fn output_file_name(&self) -> String {
        output_file_name(self.id)
    }

    /// Public projection served to polling clients.
    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.id,
            source_url: self.source_url.clone(),
            mode: self.mode,
            status: self.status,
            stage: self.stage,
            stage_detail: self.stage_detail.clone(),
            output_path: self.output_path.clone(),
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// `output_path` iff completed, `error_message` iff failed.
    pub fn terminal_fields_consistent(&self) -> bool {
        (self.output_path.is_some() == (self.status == JobStatus::Completed))
            && (self.error_message.is_some() == (self.status == JobStatus::Failed))
    }
}

pub fn output_file_name(id: Uuid) -> String {
    format!("video_{}.mp4", id)
}

/// Status query response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobView {
    pub job_id: Uuid,
    pub source_url: String,
    pub mode: RenderMode,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub stage_detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
