use super::dag::{downstream_closure, validate_stage_plan};
use super::flow_runner::{run_flow, FlowCallback, FlowResponse};
use super::{Engine, EngineError};
use crate::flows::{build_flow_path, read_flow_title, validate_name};
use crate::shared::{new_id, now_ms, LogLevel};
use crate::store::steps::CASCADE_SKIP_PREFIX;
use crate::store::{
    NewStep, RunLogEntity, RunLogLevel, RunRecord, RunStatus, StepRecord, StepStatus,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const TERMINATION_ABORTED: &str = "aborted";
pub const TERMINATION_SERVER_RESTART: &str = "server_restart";

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortResult {
    pub run: RunRecord,
    pub already_completed: bool,
    pub processes_killed: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseResult {
    pub run: RunRecord,
    pub paused: bool,
    pub processes_killed: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStepResult {
    pub step: StepRecord,
    #[serde(rename = "cascadedSteps")]
    pub cascaded: Vec<StepRecord>,
}

enum StageOutcome {
    Completed(String),
    CompletedFinal,
    Failed(String),
    /// Pause or abort took the run over while the stage was settling; the
    /// driving thread just steps aside.
    Interrupted,
}

/// Creates a run for a named flow and hands it to a fresh orchestrator
/// thread. The flow must exist under the flows root with an entry script.
pub fn create_run(
    engine: &Arc<Engine>,
    flow_name: &str,
    input: Option<&Value>,
    metadata: Option<&Value>,
) -> Result<RunRecord, EngineError> {
    let script = build_flow_path(&engine.settings.flows_root, flow_name)?;
    if !script.is_file() {
        return Err(EngineError::FlowUnavailable {
            flow_name: flow_name.to_string(),
            reason: "flow.sh not found".to_string(),
        });
    }

    let run_id = new_id("run");
    let run = engine
        .store
        .insert_run(&run_id, flow_name, input, metadata, now_ms())?;
    if let Ok(Some(title)) = read_flow_title(&engine.settings.flows_root.join(flow_name)) {
        let _ = engine
            .store
            .update_run_display(&run_id, None, None, Some(&title), None, None);
    }
    let _ = engine.store.append_run_log(
        &run_id,
        RunLogEntity::Run,
        None,
        RunLogLevel::Info,
        &format!("run created for flow {flow_name}"),
        None,
    );
    engine.log(
        LogLevel::Info,
        "run.created",
        &format!("run_id={run_id} flow={flow_name}"),
    );

    start_run_thread(engine.clone(), run_id.clone());
    engine.store.load_run(&run_id).map_err(EngineError::from)
}

/// Detached driver thread for one run. Errors never escape: the run is
/// failed in place and the thread exits cleanly.
pub fn start_run_thread(engine: Arc<Engine>, run_id: String) -> JoinHandle<()> {
    thread::spawn(move || {
        if let Err(err) = drive_run(&engine, &run_id) {
            engine.log(
                LogLevel::Error,
                "run.driver_error",
                &format!("run_id={run_id} error={err}"),
            );
            // A control operation may already have settled the run; only
            // organic driver failures are recorded.
            let still_live = matches!(
                engine.store.find_run(&run_id),
                Ok(Some(run)) if !run.status.is_terminal()
            );
            if still_live {
                let _ = engine.store.mark_run_failed(
                    &run_id,
                    Some(&json!({"message": err.to_string()})),
                    None,
                    now_ms(),
                );
                let _ = engine.store.append_run_log(
                    &run_id,
                    RunLogEntity::Run,
                    None,
                    RunLogLevel::Error,
                    &format!("run failed: {err}"),
                    None,
                );
            }
        }
    })
}

fn drive_run(engine: &Arc<Engine>, run_id: &str) -> Result<(), EngineError> {
    let run = engine.store.load_run(run_id)?;
    if run.status.is_terminal() {
        return Ok(());
    }
    engine.store.mark_run_running(run_id, now_ms())?;
    let _ = engine.store.append_run_log(
        run_id,
        RunLogEntity::Run,
        None,
        RunLogLevel::Info,
        "run started",
        None,
    );
    engine.log(LogLevel::Info, "run.started", &format!("run_id={run_id}"));

    let mut callback = FlowCallback::Initial;
    loop {
        let flow = run_flow(engine, run_id, &run.flow_name, &callback)?;
        engine.store.set_run_flow_capture(
            run_id,
            Some(&flow.outcome.stdout),
            Some(&flow.outcome.stderr),
        )?;

        let Some(response) = flow.response else {
            fail_run(
                engine,
                run_id,
                &format!(
                    "flow script produced no stage plan (exit code {})",
                    flow.outcome.exit_code
                ),
            )?;
            return Ok(());
        };

        match run_stage(engine, run_id, &response)? {
            StageOutcome::Interrupted => return Ok(()),
            StageOutcome::CompletedFinal => {
                engine.store.mark_run_completed(run_id, now_ms())?;
                let _ = engine.store.append_run_log(
                    run_id,
                    RunLogEntity::Run,
                    None,
                    RunLogLevel::Info,
                    "run completed",
                    None,
                );
                engine.log(LogLevel::Info, "run.completed", &format!("run_id={run_id}"));
                return Ok(());
            }
            StageOutcome::Completed(stage_name) => {
                callback = FlowCallback::StageCompleted(stage_name);
            }
            StageOutcome::Failed(stage_name) => {
                // Give the flow its stage-failed callback before the run
                // goes terminal; any plan it prints here is not executed.
                let cb = FlowCallback::StageFailed(stage_name.clone());
                if let Ok(flow) = run_flow(engine, run_id, &run.flow_name, &cb) {
                    let _ = engine.store.set_run_flow_capture(
                        run_id,
                        Some(&flow.outcome.stdout),
                        Some(&flow.outcome.stderr),
                    );
                }
                fail_run(engine, run_id, &format!("stage {stage_name} failed"))?;
                return Ok(());
            }
        }
    }
}

fn fail_run(engine: &Arc<Engine>, run_id: &str, message: &str) -> Result<(), EngineError> {
    engine.store.mark_run_failed(
        run_id,
        Some(&json!({"message": message})),
        None,
        now_ms(),
    )?;
    let _ = engine.store.append_run_log(
        run_id,
        RunLogEntity::Run,
        None,
        RunLogLevel::Error,
        &format!("run failed: {message}"),
        None,
    );
    engine.log(
        LogLevel::Warn,
        "run.failed",
        &format!("run_id={run_id} reason={message}"),
    );
    Ok(())
}

fn run_stage(
    engine: &Arc<Engine>,
    run_id: &str,
    response: &FlowResponse,
) -> Result<StageOutcome, EngineError> {
    let stage = match engine.store.find_stage_by_name(run_id, &response.stage)? {
        Some(existing) if existing.status == crate::store::StageStatus::Completed => {
            // Idempotent replanning after retry or resume: the stage is
            // already settled, move straight past it.
            return Ok(if existing.r#final {
                StageOutcome::CompletedFinal
            } else {
                StageOutcome::Completed(existing.name)
            });
        }
        Some(existing) => {
            engine.store.reopen_stage(&existing.id, now_ms())?;
            engine.store.load_stage(&existing.id)?
        }
        None => engine.store.insert_stage(
            &new_id("stage"),
            run_id,
            &response.stage,
            response.r#final,
            now_ms(),
        )?,
    };

    let plan: Vec<NewStep> = response
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

    if let Err(reason) = validate_plan(&plan) {
        let _ = engine.store.append_run_log(
            run_id,
            RunLogEntity::Stage,
            Some(&stage.id),
            RunLogLevel::Error,
            &format!("stage {} rejected: {reason}", stage.name),
            None,
        );
        engine.store.mark_stage_failed(&stage.id, None, now_ms())?;
        engine.log(
            LogLevel::Warn,
            "stage.rejected",
            &format!("run_id={run_id} stage={} reason={reason}", stage.name),
        );
        return Ok(StageOutcome::Failed(stage.name));
    }

    engine
        .store
        .insert_stage_steps(run_id, &stage.id, &plan, now_ms())?;
    let _ = engine.store.append_run_log(
        run_id,
        RunLogEntity::Stage,
        Some(&stage.id),
        RunLogLevel::Info,
        &format!("stage {} started with {} steps", stage.name, plan.len()),
        None,
    );
    engine.log(
        LogLevel::Info,
        "stage.started",
        &format!("run_id={run_id} stage={} steps={}", stage.name, plan.len()),
    );

    wait_for_settlement(engine, run_id, &stage.id)?;

    let run = engine.store.load_run(run_id)?;
    if run.status != RunStatus::Running {
        return Ok(StageOutcome::Interrupted);
    }

    let rows = engine.store.steps_for_stage(&stage.id)?;
    let failed = rows
        .iter()
        .filter(|step| step.status == StepStatus::Failed)
        .count();
    if failed > 0 {
        engine.store.mark_stage_failed(&stage.id, None, now_ms())?;
        let _ = engine.store.append_run_log(
            run_id,
            RunLogEntity::Stage,
            Some(&stage.id),
            RunLogLevel::Error,
            &format!("stage {} failed ({failed} failed steps)", stage.name),
            None,
        );
        engine.log(
            LogLevel::Warn,
            "stage.failed",
            &format!("run_id={run_id} stage={} failed_steps={failed}", stage.name),
        );
        return Ok(StageOutcome::Failed(stage.name));
    }

    engine.store.mark_stage_completed(&stage.id, now_ms())?;
    let _ = engine.store.append_run_log(
        run_id,
        RunLogEntity::Stage,
        Some(&stage.id),
        RunLogLevel::Info,
        &format!("stage {} completed", stage.name),
        None,
    );
    engine.log(
        LogLevel::Info,
        "stage.completed",
        &format!("run_id={run_id} stage={}", stage.name),
    );
    Ok(if stage.r#final {
        StageOutcome::CompletedFinal
    } else {
        StageOutcome::Completed(stage.name)
    })
}

fn validate_plan(plan: &[NewStep]) -> Result<(), String> {
    for step in plan {
        validate_name("step id", &step.id).map_err(|err| err.to_string())?;
        validate_name("step name", &step.name).map_err(|err| err.to_string())?;
    }
    validate_stage_plan(plan).map_err(|err| err.to_string())
}

/// Parks until every step in the stage is terminal, applying attempt
/// retries and cascade failure along the way. Returns early when the run
/// leaves `running` (pause or abort).
fn wait_for_settlement(
    engine: &Arc<Engine>,
    run_id: &str,
    stage_id: &str,
) -> Result<(), EngineError> {
    let poll = Duration::from_millis(engine.settings.scheduler_interval_ms.min(200));
    loop {
        let run = engine.store.load_run(run_id)?;
        if run.status != RunStatus::Running {
            return Ok(());
        }

        let rows = engine.store.steps_for_stage(stage_id)?;

        // Attempt retries come first: a failed step with budget left goes
        // back to pending before any cascade is computed.
        let mut retried = false;
        for step in &rows {
            if step.status == StepStatus::Failed
                && step.termination_reason.is_none()
                && !is_cascade_skip(step)
                && step.retry_count < step.max_retries
            {
                engine.store.reset_step_attempt(run_id, &step.id, now_ms())?;
                let _ = engine.store.append_run_log(
                    run_id,
                    RunLogEntity::Step,
                    Some(&step.id),
                    RunLogLevel::Warn,
                    &format!(
                        "step {} failed, retrying (attempt {} of {})",
                        step.id,
                        step.retry_count + 2,
                        step.max_retries + 1
                    ),
                    None,
                );
                retried = true;
            }
        }
        if retried {
            thread::sleep(poll);
            continue;
        }

        for step in &rows {
            if step.status == StepStatus::Failed && step.retry_count >= step.max_retries {
                for dependent_id in downstream_closure(&rows, &step.id) {
                    let dependent = rows.iter().find(|row| row.id == dependent_id);
                    if let Some(dependent) = dependent {
                        if !dependent.status.is_terminal() {
                            engine
                                .store
                                .cascade_fail_step(run_id, &dependent_id, &step.id, now_ms())?;
                        }
                    }
                }
            }
        }

        let rows = engine.store.steps_for_stage(stage_id)?;
        if rows.iter().all(|step| step.status.is_terminal()) {
            return Ok(());
        }
        thread::sleep(poll);
    }
}

fn is_cascade_skip(step: &StepRecord) -> bool {
    step.stderr
        .as_deref()
        .map(|stderr| stderr.starts_with(CASCADE_SKIP_PREFIX))
        .unwrap_or(false)
}

/// Abort: kill everything registered for the run, then fail all
/// non-terminal rows with `termination_reason=aborted`. Idempotent.
pub fn abort_run(
    engine: &Arc<Engine>,
    run_id: &str,
    grace_ms: Option<u64>,
) -> Result<AbortResult, EngineError> {
    let run = engine.store.load_run(run_id)?;
    if run.status.is_terminal() {
        return Ok(AbortResult {
            run,
            already_completed: true,
            processes_killed: 0,
        });
    }

    // Rows go terminal before the signals: the executor's exit handler then
    // finds the step already settled and cannot overwrite the abort reason.
    engine
        .store
        .terminate_run_rows(run_id, TERMINATION_ABORTED, false, now_ms())?;

    let grace = Duration::from_millis(grace_ms.unwrap_or(engine.settings.abort_grace_ms));
    let report = engine.registry.kill_processes_for_run(run_id, grace);
    if report.escalated > 0 {
        engine.log(
            LogLevel::Warn,
            "registry.kill.escalated",
            &format!("run_id={run_id} sigkilled={}", report.escalated),
        );
    }
    let _ = engine.store.append_run_log(
        run_id,
        RunLogEntity::Run,
        None,
        RunLogLevel::Warn,
        &format!("run aborted ({} processes signaled)", report.signaled),
        None,
    );
    engine.log(
        LogLevel::Info,
        "run.aborted",
        &format!("run_id={run_id} killed={}", report.signaled),
    );

    Ok(AbortResult {
        run: engine.store.load_run(run_id)?,
        already_completed: false,
        processes_killed: report.signaled,
    })
}

/// Pause: kill the run's processes and park every in-flight step back in
/// `pending` with `queued_at` cleared. No-op outside `running`.
pub fn pause_run(
    engine: &Arc<Engine>,
    run_id: &str,
    grace_ms: Option<u64>,
) -> Result<PauseResult, EngineError> {
    let run = engine.store.load_run(run_id)?;
    if run.status != RunStatus::Running {
        engine.log(
            LogLevel::Info,
            "run.pause.noop",
            &format!("run_id={run_id} status={}", run.status.as_str()),
        );
        return Ok(PauseResult {
            run,
            paused: false,
            processes_killed: 0,
        });
    }

    // Same ordering as abort: park the rows first so the killed children's
    // exit handlers cannot record a terminal state over them.
    engine.store.pause_run_rows(run_id)?;
    let grace = Duration::from_millis(grace_ms.unwrap_or(engine.settings.abort_grace_ms));
    let report = engine.registry.kill_processes_for_run(run_id, grace);
    let _ = engine.store.append_run_log(
        run_id,
        RunLogEntity::Run,
        None,
        RunLogLevel::Info,
        "run paused",
        None,
    );
    engine.log(LogLevel::Info, "run.paused", &format!("run_id={run_id}"));

    Ok(PauseResult {
        run: engine.store.load_run(run_id)?,
        paused: true,
        processes_killed: report.signaled,
    })
}

/// Resume a paused run: back to `pending`, then a fresh orchestrator
/// thread replans from the top. Completed stages settle instantly.
pub fn resume_run(engine: &Arc<Engine>, run_id: &str) -> Result<RunRecord, EngineError> {
    let run = engine.store.load_run(run_id)?;
    if run.status != RunStatus::Paused {
        return Err(EngineError::Conflict {
            run_id: run_id.to_string(),
            status: run.status.as_str(),
            operation: "resume",
        });
    }
    engine.store.mark_run_pending(run_id)?;
    let _ = engine.store.append_run_log(
        run_id,
        RunLogEntity::Run,
        None,
        RunLogLevel::Info,
        "run resumed",
        None,
    );
    engine.log(LogLevel::Info, "run.resumed", &format!("run_id={run_id}"));
    start_run_thread(engine.clone(), run_id.to_string());
    engine.store.load_run(run_id).map_err(EngineError::from)
}

/// Whole-run retry. Only failed runs (organic or aborted) qualify.
pub fn retry_run(engine: &Arc<Engine>, run_id: &str) -> Result<RunRecord, EngineError> {
    let run = engine.store.load_run(run_id)?;
    if run.status != RunStatus::Failed {
        return Err(EngineError::Conflict {
            run_id: run_id.to_string(),
            status: run.status.as_str(),
            operation: "retry",
        });
    }
    engine.store.reset_run_rows_for_retry(run_id)?;
    let _ = engine.store.append_run_log(
        run_id,
        RunLogEntity::Run,
        None,
        RunLogLevel::Info,
        "run retried",
        None,
    );
    engine.log(LogLevel::Info, "run.retried", &format!("run_id={run_id}"));
    start_run_thread(engine.clone(), run_id.to_string());
    engine.store.load_run(run_id).map_err(EngineError::from)
}

/// Single-step retry, optionally resetting the transitive dependents too.
/// Requires a failed step on a run that is neither completed nor actively
/// running.
pub fn retry_step(
    engine: &Arc<Engine>,
    run_id: &str,
    step_id: &str,
    cascade_downstream: bool,
) -> Result<RetryStepResult, EngineError> {
    let run = engine.store.load_run(run_id)?;
    if matches!(
        run.status,
        RunStatus::Completed | RunStatus::Running | RunStatus::Pending
    ) {
        return Err(EngineError::Conflict {
            run_id: run_id.to_string(),
            status: run.status.as_str(),
            operation: "retry-step",
        });
    }

    let step = engine.store.load_step(run_id, step_id)?;
    if step.status != StepStatus::Failed {
        return Err(EngineError::StepNotRetryable {
            step_id: step_id.to_string(),
            status: step.status.as_str().to_string(),
        });
    }

    engine.store.reset_step_manual(run_id, step_id, now_ms())?;

    let mut cascaded_ids = Vec::new();
    if cascade_downstream {
        let siblings = engine.store.steps_for_stage(&step.stage_id)?;
        for dependent_id in downstream_closure(&siblings, step_id) {
            engine
                .store
                .reset_step_manual(run_id, &dependent_id, now_ms())?;
            cascaded_ids.push(dependent_id);
        }
    }

    let _ = engine.store.append_run_log(
        run_id,
        RunLogEntity::Step,
        Some(step_id),
        RunLogLevel::Info,
        &format!(
            "step {step_id} retried manually ({} downstream resets)",
            cascaded_ids.len()
        ),
        None,
    );
    engine.log(
        LogLevel::Info,
        "step.retried",
        &format!("run_id={run_id} step_id={step_id} cascaded={}", cascaded_ids.len()),
    );

    // The run was failed or paused (guarded above); move it to running
    // here so the scheduler re-engages. The driver thread cannot do this
    // for a failed run: it deliberately no-ops on terminal rows.
    engine.store.mark_run_running(run_id, now_ms())?;
    start_run_thread(engine.clone(), run_id.to_string());

    let step = engine.store.load_step(run_id, step_id)?;
    let mut cascaded = Vec::new();
    for id in cascaded_ids {
        cascaded.push(engine.store.load_step(run_id, &id)?);
    }
    Ok(RetryStepResult { step, cascaded })
}
