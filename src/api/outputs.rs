//! Published artifact download.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;

use super::routes::AppState;
use crate::assets::sanitize_filename;

/// Only plain `*.mp4` names published by the pipeline are served.
fn is_servable_name(name: &str) -> bool {
    !name.starts_with('.') && name.ends_with(".mp4") && sanitize_filename(name) == name
}

pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(file): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    if !is_servable_name(&file) {
        return Err((StatusCode::NOT_FOUND, format!("Output {} not found", file)));
    }

    let path = state.config.outputs_dir.join(&file);
    let handle = tokio::fs::File::open(&path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, format!("Output {} not found", file)))?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    if let Ok(meta) = handle.metadata().await {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.len()));
    }
    if let Ok(value) = HeaderValue::from_str(&format!("inline; filename=\"{}\"", file)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    let body = Body::from_stream(ReaderStream::new(handle));
    Ok((headers, body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_servable_names() {
        assert!(is_servable_name("video_0b7c.mp4"));
        assert!(!is_servable_name("../jobs.json"));
        assert!(!is_servable_name("..mp4"));
        assert!(!is_servable_name("notes.txt"));
        assert!(!is_servable_name("a b.mp4"));
    }
}
