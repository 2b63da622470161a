//! Static file serving for each mind's published `pages/` tree.

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use std::path::Component;
use std::sync::Arc;

use crate::app::AppState;
use crate::error::{ApiError, ApiResult};

/// GET /pages/{mind}/{*path}. Rejects any path that would escape the mind's
/// pages directory.
pub async fn serve_page(
    State(state): State<Arc<AppState>>,
    Path((mind, path)): Path<(String, String)>,
) -> ApiResult<Response> {
    if !volute_registry::valid_mind_name(&mind) {
        return Err(ApiError::bad_request("invalid mind name"));
    }

    let relative = std::path::Path::new(&path);
    let traversal = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if traversal {
        return Err(ApiError::forbidden("path traversal rejected"));
    }

    let full = state.home.pages_dir(&mind).join(relative);
    let bytes = tokio::fs::read(&full)
        .await
        .map_err(|_| ApiError::not_found("page not found"))?;

    Ok(([(header::CONTENT_TYPE, content_type(&path))], bytes).into_response())
}

fn content_type(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("txt") | Some("md") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types() {
        assert_eq!(content_type("index.html"), "text/html; charset=utf-8");
        assert_eq!(content_type("a/b/app.js"), "text/javascript");
        assert_eq!(content_type("binary"), "application/octet-stream");
    }
}
