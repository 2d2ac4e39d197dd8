use super::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

/// Liveness plus a database probe. Degraded storage answers 503 so load
/// balancers stop routing to this instance.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let database_up = state.engine.store.ping().is_ok();
    if database_up {
        (
            StatusCode::OK,
            Json(json!({ "status": "ok", "services": { "database": "up" } })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "services": { "database": "down" } })),
        )
    }
}
