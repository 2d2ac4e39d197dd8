use super::registry::ProcessKind;
use super::spawner::{
    spawn_failure_outcome, validate_executable, ChildProcess, SpawnOutcome, SpawnRequest,
};
use super::{Engine, EngineError};
use crate::flows::build_flow_path;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Instant;

/// Why the flow script is being invoked. A stage callback carries exactly
/// one of `MAXQ_COMPLETED_STAGE` / `MAXQ_FAILED_STAGE`, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowCallback {
    Initial,
    StageCompleted(String),
    StageFailed(String),
}

/// The declarative plan a flow prints to stdout: the next stage and the
/// steps in it, with their dependency edges.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowResponse {
    pub stage: String,
    #[serde(default)]
    pub r#final: bool,
    #[serde(default)]
    pub steps: Vec<FlowStepDecl>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStepDecl {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl FlowStepDecl {
    /// A declaration without an explicit id is addressed by its step name.
    pub fn effective_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowOutcome {
    pub outcome: SpawnOutcome,
    pub response: Option<FlowResponse>,
}

/// Invokes `<flows_root>/<flow_name>/flow.sh` and parses its stdout as a
/// stage plan. A non-zero exit, a validation failure, or unparseable stdout
/// all surface as a fatal outcome; the orchestrator fails the run.
pub fn run_flow(
    engine: &Engine,
    run_id: &str,
    flow_name: &str,
    callback: &FlowCallback,
) -> Result<FlowOutcome, EngineError> {
    let script = build_flow_path(&engine.settings.flows_root, flow_name)?;

    let mut env = BTreeMap::new();
    env.insert("MAXQ_RUN_ID".to_string(), run_id.to_string());
    env.insert("MAXQ_FLOW_NAME".to_string(), flow_name.to_string());
    env.insert("MAXQ_API".to_string(), engine.settings.resolved_api_url());
    if let Some(api_key) = &engine.settings.api_key {
        env.insert("MAXQ_API_KEY".to_string(), api_key.clone());
    }
    match callback {
        FlowCallback::Initial => {}
        FlowCallback::StageCompleted(stage) => {
            env.insert("MAXQ_COMPLETED_STAGE".to_string(), stage.clone());
        }
        FlowCallback::StageFailed(stage) => {
            env.insert("MAXQ_FAILED_STAGE".to_string(), stage.clone());
        }
    }

    let request = SpawnRequest {
        executable: script.clone(),
        cwd: engine.settings.flows_root.join(flow_name),
        env,
        max_log_capture: engine.settings.max_log_capture,
    };

    let started = Instant::now();
    if let Err(reason) = validate_executable(&script) {
        let err = std::io::Error::other(reason);
        return Ok(FlowOutcome {
            outcome: spawn_failure_outcome(&err, started),
            response: None,
        });
    }

    let outcome = match ChildProcess::spawn(&request) {
        Ok(child) => {
            engine
                .registry
                .register(run_id, ProcessKind::Flow, child.pid(), None);
            let outcome = child.wait_capture();
            engine.registry.unregister(run_id, ProcessKind::Flow, None);
            outcome
        }
        Err(err) => spawn_failure_outcome(&err, started),
    };

    let response = parse_flow_response(&outcome);
    Ok(FlowOutcome { outcome, response })
}

fn parse_flow_response(outcome: &SpawnOutcome) -> Option<FlowResponse> {
    if outcome.exit_code != 0 {
        return None;
    }
    let stdout = outcome.stdout.trim();
    if stdout.is_empty() {
        return None;
    }
    serde_json::from_str(stdout).ok()
}
