//! Error kinds for the generation pipeline.
//!
//! Only [`PipelineError::Adapter`] and [`PipelineError::Schema`] are retried;
//! every other kind fails the owning job immediately.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// Bad input, rejected before a job is created.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A scraping or LLM provider failed.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// A provider payload failed structural validation.
    #[error("schema error: {0}")]
    Schema(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("generation timed out after {seconds}s")]
    GenerationTimeout { seconds: u64 },

    /// Non-zero exit or missing artifact.
    #[error("generation failed: {0}")]
    GenerationFailure(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Whether the adapter retry loop may try this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Adapter(_) | Self::Schema(_))
    }

    /// Short machine-readable kind name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Adapter(_) => "adapter",
            Self::Schema(_) => "schema",
            Self::Workspace(_) => "workspace",
            Self::GenerationTimeout { .. } => "generation_timeout",
            Self::GenerationFailure(_) => "generation_failure",
            Self::NotFound(_) => "not_found",
            Self::Cancelled(_) => "cancelled",
        }
    }

    pub fn workspace(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Workspace(format!("{}: {}", context, err))
    }
}

impl From<crate::llm::LlmError> for PipelineError {
    fn from(err: crate::llm::LlmError) -> Self {
        Self::Adapter(err.to_string())
    }
}
