//! Shared env vars (`<home>/env.json`), merged into every mind's spawn env.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::app::AppState;
use crate::error::{ApiError, ApiResult};
use volute_supervisor::env::{read_env_file, write_env_file};

#[derive(Debug, Deserialize)]
pub struct EnvValue {
    pub value: String,
}

/// GET /api/env.
pub async fn list_shared_env(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!(read_env_file(&state.home.shared_env_file())))
}

/// PUT /api/env/{key}.
pub async fn put_shared_env(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(body): Json<EnvValue>,
) -> ApiResult<Json<serde_json::Value>> {
    if key.is_empty() || key.contains('=') {
        return Err(ApiError::bad_request("invalid env key"));
    }
    let path = state.home.shared_env_file();
    let mut env = read_env_file(&path);
    env.insert(key, body.value);
    write_env_file(&path, &env).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}

/// DELETE /api/env/{key}.
pub async fn delete_shared_env(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let path = state.home.shared_env_file();
    let mut env = read_env_file(&path);
    if env.remove(&key).is_none() {
        return Err(ApiError::not_found(format!("env var {}", key)));
    }
    write_env_file(&path, &env).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}
