//! # promoreel
//!
//! Turns a product URL into a short promotional video.
//!
//! A submitted URL becomes a [`job::Job`] that a background task drives
//! through ordered stages, delegating each one to an external agent:
//!
//! ```text
//!   POST /generate ──► Orchestrator ──► Pipeline (one task per job)
//!                                          │
//!        scraping ──► analyzing ──► [storyboarding] ──► generating ──► rendering
//!           │             │               │                 │             │
//!        Scraper       Analyst         Planner      Workspace + Brief   Renderer /
//!      (w/ fallback)    (LLM)           (LLM)        + Generator        artifact
//!                                          │
//!                                       JobStore ◄── GET /status/:id
//! ```
//!
//! Storyboarding only happens in agentic mode, where a code-generation tool
//! writes the composition from a compiled brief. Templated mode fills a
//! fixed-schema config into the template project and renders it directly.
//!
//! ## Modules
//! - `adapters`: scraping, analysis and planning behind capability traits
//! - `brief`: pure storyboard to brief compiler
//! - `workspace`: per-job isolated project copies
//! - `sandbox`: subprocess runner with hard timeouts and group kill
//! - `pipeline` / `orchestrator`: the stage machine and job ownership
//! - `api`: HTTP surface

pub mod adapters;
pub mod api;
pub mod assets;
pub mod audio;
pub mod brief;
pub mod config;
pub mod error;
pub mod job;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod sandbox;
pub mod store;
pub mod workspace;

pub use config::Config;
pub use error::{PipelineError, PipelineResult};
pub use job::{Job, JobStatus, RenderMode, Stage};
pub use orchestrator::Orchestrator;
