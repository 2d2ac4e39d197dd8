use super::{blocking, ApiError, AppState};
use crate::engine::dag::validate_stage_plan;
use crate::engine::{orchestrator, FlowResponse};
use crate::flows::validate_name;
use crate::store::runs::{ListRunsQuery, SortOrder};
use crate::store::{NewStep, RunStatus};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunBody {
    pub flow_name: String,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

pub async fn create_run(
    State(state): State<AppState>,
    Json(body): Json<CreateRunBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let engine = state.engine.clone();
    let run = blocking(move || {
        orchestrator::create_run(
            &engine,
            &body.flow_name,
            body.input.as_ref(),
            body.metadata.as_ref(),
        )
        .map_err(ApiError::from)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(json!(run))))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine.clone();
    let run = blocking(move || engine.store.load_run(&id).map_err(ApiError::from)).await?;
    Ok(Json(json!(run)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRunsParams {
    #[serde(default)]
    pub flow_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: Option<String>,
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<Value>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(RunStatus::parse)
        .transpose()
        .map_err(ApiError::bad_request)?;
    let sort_order = match params.sort_order.as_deref() {
        None => None,
        Some("asc") => Some(SortOrder::Asc),
        Some("desc") => Some(SortOrder::Desc),
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "unknown sort order `{other}`; expected asc or desc"
            )))
        }
    };

    let query = ListRunsQuery {
        flow_name: params.flow_name,
        status,
        limit: params.limit,
        offset: params.offset,
        sort_by: params.sort_by,
        sort_order,
    };
    let engine = state.engine.clone();
    let page = blocking(move || engine.store.list_runs(&query).map_err(ApiError::from)).await?;
    Ok(Json(json!({
        "data": page.data,
        "pagination": {
            "total": page.total,
            "limit": page.limit,
            "offset": page.offset,
        }
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRunBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub flow_title: Option<String>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

pub async fn patch_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchRunBody>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine.clone();
    let run = blocking(move || {
        engine
            .store
            .update_run_display(
                &id,
                body.name.as_deref(),
                body.description.as_deref(),
                body.flow_title.as_deref(),
                body.output.as_ref(),
                body.metadata.as_ref(),
            )
            .map_err(ApiError::from)
    })
    .await?;
    Ok(Json(json!(run)))
}

pub async fn list_steps(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine.clone();
    let steps = blocking(move || {
        engine.store.load_run(&run_id)?;
        engine.store.steps_for_run(&run_id).map_err(ApiError::from)
    })
    .await?;
    Ok(Json(json!({ "steps": steps })))
}

/// Stage declarations over HTTP are validated and acknowledged but not
/// executed; the authoritative plan is the flow script's stdout JSON.
pub async fn declare_steps(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<FlowResponse>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let engine = state.engine.clone();
    let step_count = body.steps.len();
    let stage = body.stage.clone();
    blocking(move || {
        engine.store.load_run(&run_id)?;
        let plan: Vec<NewStep> = body
            .steps
            .iter()
            .map(|decl| NewStep {
                id: decl.effective_id(),
                name: decl.name.clone(),
                depends_on: decl.depends_on.clone(),
                max_retries: decl.max_retries,
                env: decl.env.clone(),
            })
            .collect();
        for step in &plan {
            validate_name("step id", &step.id)
                .and_then(|()| validate_name("step name", &step.name))
                .map_err(|err| ApiError::bad_request(err.to_string()))?;
        }
        validate_stage_plan(&plan).map_err(|err| ApiError::bad_request(err.to_string()))?;
        Ok(())
    })
    .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "stage": stage, "steps": step_count })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct StepFieldsBody {
    pub fields: Map<String, Value>,
}

pub async fn post_step_fields(
    State(state): State<AppState>,
    Path((run_id, step_id)): Path<(String, String)>,
    Json(body): Json<StepFieldsBody>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine.clone();
    let step = blocking(move || {
        engine
            .store
            .merge_step_fields(&run_id, &step_id, &body.fields)
            .map_err(ApiError::from)
    })
    .await?;
    Ok(Json(json!(step)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldsParams {
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub field_name: Option<String>,
}

pub async fn query_fields(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(params): Query<FieldsParams>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine.clone();
    let entries = blocking(move || {
        engine.store.load_run(&run_id)?;
        engine
            .store
            .query_step_fields(&run_id, params.step_id.as_deref(), params.field_name.as_deref())
            .map_err(ApiError::from)
    })
    .await?;
    Ok(Json(json!({ "fields": entries })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn list_logs(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(params): Query<LogsParams>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine.clone();
    let logs = blocking(move || {
        engine.store.load_run(&run_id)?;
        engine
            .store
            .logs_for_run(&run_id, params.limit.unwrap_or(500))
            .map_err(ApiError::from)
    })
    .await?;
    Ok(Json(json!({ "logs": logs })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraceParams {
    #[serde(default)]
    pub grace_ms: Option<u64>,
}

pub async fn abort_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(params): Query<GraceParams>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine.clone();
    let result = blocking(move || {
        orchestrator::abort_run(&engine, &run_id, params.grace_ms).map_err(ApiError::from)
    })
    .await?;
    Ok(Json(json!(result)))
}

pub async fn pause_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(params): Query<GraceParams>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine.clone();
    let result = blocking(move || {
        orchestrator::pause_run(&engine, &run_id, params.grace_ms).map_err(ApiError::from)
    })
    .await?;
    Ok(Json(json!(result)))
}

pub async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine.clone();
    let run =
        blocking(move || orchestrator::resume_run(&engine, &run_id).map_err(ApiError::from))
            .await?;
    Ok(Json(json!(run)))
}

pub async fn retry_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine.clone();
    let run = blocking(move || orchestrator::retry_run(&engine, &run_id).map_err(ApiError::from))
        .await?;
    Ok(Json(json!(run)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStepBody {
    #[serde(default)]
    pub cascade_downstream: bool,
}

pub async fn retry_step(
    State(state): State<AppState>,
    Path((run_id, step_id)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, ApiError> {
    // The body is optional; an empty POST means no downstream cascade.
    let cascade = if body.is_empty() {
        false
    } else {
        serde_json::from_slice::<RetryStepBody>(&body)
            .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))?
            .cascade_downstream
    };
    let engine = state.engine.clone();
    let result = blocking(move || {
        orchestrator::retry_step(&engine, &run_id, &step_id, cascade).map_err(ApiError::from)
    })
    .await?;
    Ok(Json(json!(result)))
}
