//! The mind-scoped HTTP surface: provisioning, lifecycle, history, env,
//! schedules, connector channel mappings, and variants.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::pipeline;
use volute_core::config::MindConfig;
use volute_core::types::{ContentBlock, Stage};
use volute_registry::MindEntry;
use volute_store::DeliveryStatus;
use volute_supervisor::env::{read_env_file, write_env_file};

fn mind_json(state: &AppState, entry: &MindEntry) -> serde_json::Value {
    let running = state.supervisor.is_running(&entry.name);
    json!({
        "name": entry.name,
        "port": entry.port,
        "created": entry.created,
        "running": entry.running,
        "status": if running { "running" } else { "stopped" },
        "stage": entry.stage,
        "template": entry.template,
    })
}

fn find_mind(state: &AppState, name: &str) -> ApiResult<MindEntry> {
    state
        .registry
        .find(name)
        .ok_or_else(|| ApiError::not_found(format!("mind {}", name)))
}

/// Schedules, variants, and connector channels stay locked until a mind is
/// sprouted.
fn require_sprouted(entry: &MindEntry) -> ApiResult<()> {
    if entry.stage == Stage::Seed {
        return Err(ApiError::forbidden(format!(
            "mind {} is still a seed",
            entry.name
        )));
    }
    Ok(())
}

fn require_admin(user: &AuthUser) -> ApiResult<()> {
    if !user.0.is_daemon() && !user.0.role.is_admin() {
        return Err(ApiError::forbidden("admin required"));
    }
    Ok(())
}

/// GET /api/minds (also served as /api/agents for older clients).
pub async fn list_minds(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let minds: Vec<serde_json::Value> = state
        .registry
        .list()
        .iter()
        .map(|entry| mind_json(&state, entry))
        .collect();
    Json(json!({ "minds": minds }))
}

#[derive(Debug, Deserialize)]
pub struct CreateMind {
    pub name: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub template: Option<String>,
}

/// POST /api/minds. Provisions the registry entry, the working directory,
/// and the mind's own user account. New minds start as seeds.
pub async fn create_mind(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CreateMind>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    require_admin(&user)?;
    let port = body.port.unwrap_or_else(|| state.registry.next_port());
    let entry = state
        .registry
        .add(&body.name, port, Stage::Seed, body.template)?;

    std::fs::create_dir_all(state.home.mind_dir(&entry.name))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    std::fs::create_dir_all(state.home.state_dir(&entry.name))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    state.store.ensure_mind_user(&entry.name)?;

    info!(mind = %entry.name, port = entry.port, "mind provisioned");
    Ok((StatusCode::CREATED, Json(mind_json(&state, &entry))))
}

/// GET /api/minds/{name}.
pub async fn get_mind(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let entry = find_mind(&state, &name)?;
    Ok(Json(mind_json(&state, &entry)))
}

/// DELETE /api/minds/{name}. Stops the mind if needed, then retires its
/// registry entry, history, schedules memo, and budget.
pub async fn delete_mind(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&user)?;
    find_mind(&state, &name)?;

    if state.supervisor.is_running(&name) {
        state.supervisor.stop_mind(&name).await?;
    }
    state.registry.remove(&name)?;
    state.scheduler.forget(&name);
    state.activity.retire(&name);
    if let Err(e) = state.budget.remove_budget(&name) {
        warn!(mind = %name, error = %e, "failed to remove budget state");
    }
    state.store.clear_history(&name)?;
    info!(mind = %name, "mind retired");
    Ok(Json(json!({ "ok": true })))
}

/// POST /api/minds/{name}/start.
pub async fn start_mind(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.supervisor.start_mind(&name).await?;
    replay_pending_deliveries(state.clone(), name.clone());
    Ok(Json(json!({ "ok": true, "status": "running" })))
}

/// POST /api/minds/{name}/stop.
pub async fn stop_mind(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.supervisor.stop_mind(&name).await?;
    Ok(Json(json!({ "ok": true, "status": "stopped" })))
}

/// POST /api/minds/{name}/restart.
pub async fn restart_mind(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.supervisor.restart_mind(&name).await?;
    replay_pending_deliveries(state.clone(), name.clone());
    Ok(Json(json!({ "ok": true, "status": "running" })))
}

/// Replay queued deliveries for a freshly started mind, in order, off the
/// request path.
fn replay_pending_deliveries(state: Arc<AppState>, name: String) {
    tokio::spawn(async move {
        let pending = match state.store.pending_deliveries(&name) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(mind = %name, error = %e, "failed to read delivery queue");
                return;
            }
        };
        for entry in pending {
            let content: Vec<ContentBlock> = entry
                .payload
                .get("content")
                .and_then(|c| serde_json::from_value(c.clone()).ok())
                .unwrap_or_default();
            let channel = entry.channel.as_deref().unwrap_or("system:delivery");
            let outcome = pipeline::deliver_internal(
                &state,
                &name,
                &content,
                channel,
                entry.sender.as_deref(),
            )
            .await;
            let status = match outcome {
                Ok(()) => DeliveryStatus::Delivered,
                Err(_) => DeliveryStatus::Failed,
            };
            if let Err(e) = state.store.mark_delivery(entry.id, status) {
                warn!(mind = %name, delivery = entry.id, error = %e, "failed to mark delivery");
            }
        }
    });
}

#[derive(Debug, Deserialize)]
pub struct WakeBody {
    #[serde(default)]
    pub message: Option<String>,
}

/// POST /api/minds/{name}/wake. Injects a system message; if the mind is
/// offline the message lands in the delivery queue instead.
pub async fn wake_mind(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: axum::body::Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    find_mind(&state, &name)?;
    let text = serde_json::from_slice::<WakeBody>(&body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| "wake up".to_string());
    let content = vec![ContentBlock::text(text)];

    match pipeline::deliver_internal(&state, &name, &content, "system:wake", Some("wake")).await {
        Ok(()) => Ok(Json(json!({ "ok": true }))),
        Err(e) if e.status == StatusCode::SERVICE_UNAVAILABLE => {
            let payload = json!({ "content": content });
            state
                .store
                .queue_delivery(&name, None, Some("system:wake"), Some("wake"), &payload)?;
            Ok(Json(json!({ "ok": true, "queued": true })))
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /api/minds/{name}/history.
pub async fn history(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    find_mind(&state, &name)?;
    let rows = state
        .store
        .list_history(&name, query.limit.unwrap_or(100).min(1000))?;
    Ok(Json(json!({ "history": rows })))
}

/// GET /api/minds/{name}/schedules.
pub async fn schedules(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let entry = find_mind(&state, &name)?;
    require_sprouted(&entry)?;
    let config = MindConfig::load(&state.home.mind_config(&name))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "schedules": config.schedules })))
}

/// GET /api/minds/{name}/channels. Connector-to-platform channel mappings.
pub async fn get_channel_map(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let entry = find_mind(&state, &name)?;
    require_sprouted(&entry)?;
    let path = state.home.mind_channels_file(&name);
    let map = match std::fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| json!({})),
        Err(_) => json!({}),
    };
    Ok(Json(map))
}

/// PUT /api/minds/{name}/channels.
pub async fn put_channel_map(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(map): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let entry = find_mind(&state, &name)?;
    require_sprouted(&entry)?;
    if !map.is_object() {
        return Err(ApiError::bad_request("channel map must be an object"));
    }
    let path = state.home.mind_channels_file(&name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ApiError::internal(e.to_string()))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, map.to_string()).map_err(|e| ApiError::internal(e.to_string()))?;
    std::fs::rename(&tmp, &path).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct StageBody {
    pub stage: Stage,
}

/// PUT /api/minds/{name}/stage. Sprouting unlocks schedules, connectors,
/// and variants.
pub async fn set_stage(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(name): Path<String>,
    Json(body): Json<StageBody>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&user)?;
    find_mind(&state, &name)?;
    state.registry.set_stage(&name, body.stage)?;
    info!(mind = %name, stage = %body.stage, "mind stage changed");
    Ok(Json(json!({ "ok": true, "stage": body.stage })))
}

#[derive(Debug, Deserialize)]
pub struct BudgetBody {
    pub token_limit: u64,
    #[serde(default)]
    pub period_minutes: u64,
}

/// PUT /api/minds/{name}/budget.
pub async fn set_budget(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(name): Path<String>,
    Json(body): Json<BudgetBody>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&user)?;
    find_mind(&state, &name)?;
    state
        .budget
        .set_budget(&name, body.token_limit, body.period_minutes)?;
    Ok(Json(json!({ "ok": true })))
}

/// GET /api/minds/{name}/budget.
pub async fn get_budget(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    find_mind(&state, &name)?;
    Ok(Json(json!({
        "tokens_used": state.budget.tokens_used(&name),
        "queued": state.budget.queue_len(&name),
        "status": match state.budget.check_budget(&name) {
            volute_budget::BudgetStatus::Ok => "ok",
            volute_budget::BudgetStatus::Warning => "warning",
            volute_budget::BudgetStatus::Exceeded => "exceeded",
        },
    })))
}

// --- per-mind env ----------------------------------------------------------

/// GET /api/minds/{name}/env.
pub async fn list_mind_env(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    find_mind(&state, &name)?;
    Ok(Json(json!(read_env_file(&state.home.mind_env_file(&name)))))
}

#[derive(Debug, Deserialize)]
pub struct EnvValue {
    pub value: String,
}

/// PUT /api/minds/{name}/env/{key}.
pub async fn put_mind_env(
    State(state): State<Arc<AppState>>,
    Path((name, key)): Path<(String, String)>,
    Json(body): Json<EnvValue>,
) -> ApiResult<Json<serde_json::Value>> {
    find_mind(&state, &name)?;
    if key.is_empty() || key.contains('=') {
        return Err(ApiError::bad_request("invalid env key"));
    }
    let path = state.home.mind_env_file(&name);
    let mut env = read_env_file(&path);
    env.insert(key, body.value);
    write_env_file(&path, &env).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}

/// DELETE /api/minds/{name}/env/{key}.
pub async fn delete_mind_env(
    State(state): State<Arc<AppState>>,
    Path((name, key)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    find_mind(&state, &name)?;
    let path = state.home.mind_env_file(&name);
    let mut env = read_env_file(&path);
    if env.remove(&key).is_none() {
        return Err(ApiError::not_found(format!("env var {}", key)));
    }
    write_env_file(&path, &env).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}

// --- variants --------------------------------------------------------------

/// GET /api/minds/{name}/variants.
pub async fn list_variants(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let entry = find_mind(&state, &name)?;
    require_sprouted(&entry)?;
    Ok(Json(json!({ "variants": state.registry.list_variants(&name) })))
}

#[derive(Debug, Deserialize)]
pub struct CreateVariant {
    pub variant: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// POST /api/minds/{name}/variants.
pub async fn create_variant(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(name): Path<String>,
    Json(body): Json<CreateVariant>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    require_admin(&user)?;
    let entry = find_mind(&state, &name)?;
    require_sprouted(&entry)?;

    let port = body.port.unwrap_or_else(|| state.registry.next_port());
    let branch = body.branch.unwrap_or_else(|| body.variant.clone());
    let path = body.path.unwrap_or_else(|| {
        state
            .home
            .minds_dir()
            .join(format!("{}@{}", name, body.variant))
            .to_string_lossy()
            .into_owned()
    });
    let variant = state
        .registry
        .add_variant(&name, &body.variant, &branch, &path, port)?;
    info!(variant = %variant.canonical(), port, "variant registered");
    Ok((StatusCode::CREATED, Json(json!({ "variant": variant }))))
}

/// DELETE /api/minds/{name}/variants/{variant}.
pub async fn delete_variant(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((name, variant)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&user)?;
    let canonical = format!("{}@{}", name, variant);
    if state.supervisor.is_running(&canonical) {
        state.supervisor.stop_mind(&canonical).await?;
    }
    state.registry.remove_variant(&name, &variant)?;
    Ok(Json(json!({ "ok": true })))
}
