use super::{blocking, ApiError, AppState};
use crate::flows::discover_flows;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

pub async fn list_flows(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let engine = state.engine.clone();
    let flows = blocking(move || {
        discover_flows(&engine.settings.flows_root).map_err(|err| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        })
    })
    .await?;
    Ok(Json(json!({ "flows": flows })))
}
