//! Request authentication and CSRF.
//!
//! Two credentials are accepted: the daemon's boot bearer token (CLI and
//! connector bridges, implicit "daemon" identity with user id 0) and the
//! `volute_session` cookie backed by the sessions table. Mutating browser
//! requests must additionally carry an `Origin` equal to the daemon's own
//! origin; bearer-token requests carry no ambient authority and skip the
//! origin check.

use axum::extract::{Request, State};
use axum::http::{header, Method};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

use crate::app::AppState;
use crate::error::ApiError;
use volute_store::User;

pub const SESSION_COOKIE: &str = "volute_session";

/// The authenticated caller, inserted as a request extension.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl AuthUser {
    /// Daemon identity and admins bypass conversation-participant checks.
    pub fn bypasses_participant_checks(&self) -> bool {
        self.0.is_daemon() || self.0.role.is_admin()
    }
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Pull one cookie value out of the `Cookie` header.
pub fn cookie_value<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    let cookies = request.headers().get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

/// Authentication layer for the protected API surface.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(token) = bearer_token(&request) {
        if token == state.token {
            request.extensions_mut().insert(AuthUser(User::daemon()));
            return Ok(next.run(request).await);
        }
        return Err(ApiError::unauthorized("invalid bearer token"));
    }

    if let Some(session_id) = cookie_value(&request, SESSION_COOKIE) {
        let session = state
            .store
            .get_session(session_id)?
            .ok_or_else(|| ApiError::unauthorized("session expired"))?;
        let user = state
            .store
            .get_user(session.user_id)?
            .ok_or_else(|| ApiError::unauthorized("session user missing"))?;
        request.extensions_mut().insert(AuthUser(user));
        return Ok(next.run(request).await);
    }

    Err(ApiError::unauthorized("missing session or token"))
}

/// Reject mutating cross-origin browser requests. Applied to the whole
/// surface, ahead of authentication.
pub async fn csrf_guard(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let mutating = !matches!(
        *request.method(),
        Method::GET | Method::HEAD | Method::OPTIONS
    );
    let has_valid_bearer = bearer_token(&request)
        .map(|t| t == state.token)
        .unwrap_or(false);

    if mutating && !has_valid_bearer {
        let origin = request
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok());
        if origin != Some(state.config.origin().as_str()) {
            return Err(ApiError::forbidden("origin mismatch"));
        }
    }
    Ok(next.run(request).await)
}

/// `Set-Cookie` value for a fresh session.
pub fn session_cookie(session_id: &str) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax",
        SESSION_COOKIE, session_id
    )
}

/// `Set-Cookie` value that clears the session cookie.
pub fn clear_session_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; Max-Age=0", SESSION_COOKIE)
}
