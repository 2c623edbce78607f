//! HTTP API: submission, status, job control, health and artifact download.

mod outputs;
pub mod routes;
pub mod types;

pub use routes::{build_router, serve, AppState};
