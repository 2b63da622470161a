use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::app::AppState;
use crate::auth::{clear_session_cookie, cookie_value, session_cookie, AuthUser};
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// POST /api/auth/register. The first account becomes admin; everyone after
/// starts pending until an admin promotes them. A session cookie is issued
/// either way.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(creds): Json<Credentials>,
) -> ApiResult<Response> {
    if creds.username.is_empty() || creds.password.is_empty() {
        return Err(ApiError::bad_request("username and password are required"));
    }
    let user = state.store.create_user(&creds.username, &creds.password)?;
    let session = state.store.create_session(user.id)?;
    info!(username = %user.username, role = %user.role, "user registered");

    Ok((
        StatusCode::CREATED,
        [(header::SET_COOKIE, session_cookie(&session.id))],
        Json(json!({ "user": user })),
    )
        .into_response())
}

/// POST /api/auth/login.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(creds): Json<Credentials>,
) -> ApiResult<Response> {
    let user = state.store.verify_password(&creds.username, &creds.password)?;
    let session = state.store.create_session(user.id)?;

    Ok((
        [(header::SET_COOKIE, session_cookie(&session.id))],
        Json(json!({ "user": user })),
    )
        .into_response())
}

/// POST /api/auth/logout. Revokes the presented session explicitly.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
) -> ApiResult<Response> {
    if let Some(session_id) = cookie_value(&request, crate::auth::SESSION_COOKIE) {
        state.store.delete_session(session_id)?;
    }
    Ok((
        [(header::SET_COOKIE, clear_session_cookie())],
        Json(json!({ "ok": true })),
    )
        .into_response())
}

/// GET /api/auth/me.
pub async fn me(Extension(user): Extension<AuthUser>) -> Json<serde_json::Value> {
    Json(json!({ "user": user.0 }))
}

/// GET /api/users. Admin only.
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&user)?;
    Ok(Json(json!({ "users": state.store.list_users()? })))
}

#[derive(Debug, Deserialize)]
pub struct RoleBody {
    pub role: volute_core::types::UserRole,
}

/// PUT /api/users/{id}/role. How an admin promotes a pending registration.
pub async fn set_user_role(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    axum::extract::Path(id): axum::extract::Path<i64>,
    Json(body): Json<RoleBody>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&user)?;
    state.store.set_user_role(id, body.role)?;
    Ok(Json(json!({ "ok": true })))
}

fn require_admin(user: &AuthUser) -> ApiResult<()> {
    if !user.0.is_daemon() && !user.0.role.is_admin() {
        return Err(ApiError::forbidden("admin required"));
    }
    Ok(())
}
