use axum::Json;
use serde_json::{json, Value};

/// GET /api/health. Unauthenticated liveness probe.
pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
