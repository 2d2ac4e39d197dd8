pub mod error;
mod flows;
mod health;
mod runs;

pub use error::ApiError;

use crate::engine::Engine;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Builds the full route table. `/health` stays outside the authenticated
/// subtree so probes work without credentials.
pub fn build_router(engine: Arc<Engine>) -> Router {
    let state = AppState { engine };

    let api = Router::new()
        .route("/flows", get(flows::list_flows))
        .route("/runs", post(runs::create_run).get(runs::list_runs))
        .route("/runs/{id}", get(runs::get_run).patch(runs::patch_run))
        .route(
            "/runs/{run_id}/steps",
            get(runs::list_steps).post(runs::declare_steps),
        )
        .route(
            "/runs/{run_id}/steps/{step_id}/fields",
            post(runs::post_step_fields),
        )
        .route("/runs/{run_id}/fields", get(runs::query_fields))
        .route("/runs/{run_id}/logs", get(runs::list_logs))
        .route("/runs/{run_id}/abort", post(runs::abort_run))
        .route("/runs/{run_id}/pause", post(runs::pause_run))
        .route("/runs/{run_id}/resume", post(runs::resume_run))
        .route("/runs/{run_id}/retry", post(runs::retry_run))
        .route(
            "/runs/{run_id}/steps/{step_id}/retry",
            post(runs::retry_step),
        )
        .route("/health", get(health::health))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health::health))
        .with_state(state)
        .nest("/api/v1", api)
}

/// Bearer-token guard, active only when an API key is configured.
async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.engine.settings.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };
    if request.uri().path().ends_with("/health") {
        return Ok(next.run(request).await);
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => Ok(next.run(request).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

/// Engine calls are synchronous (they sit on the SQLite mutex and may wait
/// out kill grace periods); every handler crosses into them through the
/// blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("background task failed: {err}"),
        })?
}
