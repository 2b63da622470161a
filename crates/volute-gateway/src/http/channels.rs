//! Volute-internal named channels.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::app::AppState;
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use volute_store::ParticipantRole;

#[derive(Debug, Deserialize)]
pub struct CreateChannel {
    pub name: String,
}

/// POST /api/volute/channels.
pub async fn create_channel(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CreateChannel>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    if body.name.is_empty() {
        return Err(ApiError::bad_request("channel name is required"));
    }
    let conversation = state.store.create_channel(&body.name, user.0.id)?;
    Ok((StatusCode::CREATED, Json(json!({ "channel": conversation }))))
}

/// GET /api/volute/channels.
pub async fn list_channels(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(json!({ "channels": state.store.list_channels()? })))
}

/// POST /api/volute/channels/{name}/join.
pub async fn join_channel(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let conversation = state.store.join_channel(&name, user.0.id)?;
    Ok(Json(json!({ "channel": conversation })))
}

/// POST /api/volute/channels/{name}/leave.
pub async fn leave_channel(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.store.leave_channel(&name, user.0.id)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct Invite {
    /// A username; minds are invited by their mind name and get an account
    /// on first invite.
    pub username: String,
    #[serde(default)]
    pub mind: bool,
}

/// POST /api/volute/channels/{name}/invite.
pub async fn invite_member(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(name): Path<String>,
    Json(body): Json<Invite>,
) -> ApiResult<Json<serde_json::Value>> {
    let conversation = state
        .store
        .get_channel_by_name(&name)?
        .ok_or_else(|| ApiError::not_found(format!("channel {}", name)))?;

    if !user.bypasses_participant_checks()
        && !state.store.is_participant(&conversation.id, user.0.id)?
    {
        return Err(ApiError::forbidden("only members can invite"));
    }

    let invited = if body.mind {
        state.store.ensure_mind_user(&body.username)?
    } else {
        state
            .store
            .find_user_by_username(&body.username)?
            .ok_or_else(|| ApiError::not_found(format!("user {}", body.username)))?
    };
    state
        .store
        .add_participant(&conversation.id, invited.id, ParticipantRole::Member)?;
    Ok(Json(json!({ "ok": true, "user": invited })))
}

/// GET /api/volute/channels/{name}/members.
pub async fn list_members(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let conversation = state
        .store
        .get_channel_by_name(&name)?
        .ok_or_else(|| ApiError::not_found(format!("channel {}", name)))?;
    let members = state.store.list_participants(&conversation.id)?;
    Ok(Json(json!({ "members": members })))
}
