use super::registry::ProcessKind;
use super::spawner::{
    sanitize_env, spawn_failure_outcome, validate_executable, ChildProcess, SpawnOutcome,
    SpawnRequest,
};
use super::Engine;
use crate::flows::build_step_path;
use crate::shared::LogLevel;
use crate::store::{RunLogEntity, RunLogLevel, StepRecord, StepStatus};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Runs one claimed step to completion and records the terminal row state.
///
/// This is the fire-and-forget body the scheduler detaches per claim; it
/// never returns an error. Anything that goes wrong is recorded on the row
/// and in the logs.
pub fn execute_claimed_step(engine: &Arc<Engine>, step: StepRecord) {
    let started = Instant::now();

    let run = match engine.store.find_run(&step.run_id) {
        Ok(Some(run)) => run,
        Ok(None) => {
            engine.log(
                LogLevel::Warn,
                "step.run_missing",
                &format!("run_id={} step_id={}", step.run_id, step.id),
            );
            return;
        }
        Err(err) => {
            engine.log(
                LogLevel::Error,
                "step.load_failed",
                &format!("run_id={} step_id={} error={err}", step.run_id, step.id),
            );
            return;
        }
    };

    let outcome = match build_step_path(&engine.settings.flows_root, &run.flow_name, &step.name) {
        Ok(script) => run_step_script(engine, &step, &script),
        Err(err) => spawn_failure_outcome(&std::io::Error::other(err.to_string()), started),
    };

    record_outcome(engine, &step, outcome);
}

fn run_step_script(
    engine: &Arc<Engine>,
    step: &StepRecord,
    script: &std::path::Path,
) -> SpawnOutcome {
    let started = Instant::now();

    let mut env = match &step.env {
        Some(declared) => sanitize_env(declared),
        None => BTreeMap::new(),
    };
    env.insert("MAXQ_RUN_ID".to_string(), step.run_id.clone());
    env.insert("MAXQ_STEP_ID".to_string(), step.id.clone());
    env.insert("MAXQ_STAGE_ID".to_string(), step.stage_id.clone());
    env.insert("MAXQ_API".to_string(), engine.settings.resolved_api_url());
    if let Some(api_key) = &engine.settings.api_key {
        env.insert("MAXQ_API_KEY".to_string(), api_key.clone());
    }

    let request = SpawnRequest {
        executable: script.to_path_buf(),
        cwd: script.parent().map(|p| p.to_path_buf()).unwrap_or_default(),
        env,
        max_log_capture: engine.settings.max_log_capture,
    };

    if let Err(reason) = validate_executable(script) {
        return spawn_failure_outcome(&std::io::Error::other(reason), started);
    }

    let child = match ChildProcess::spawn(&request) {
        Ok(child) => child,
        Err(err) => return spawn_failure_outcome(&err, started),
    };

    engine
        .registry
        .register(&step.run_id, ProcessKind::Step, child.pid(), Some(&step.id));

    let done = Arc::new(AtomicBool::new(false));
    let heartbeat = spawn_heartbeat(engine, step, done.clone());

    let outcome = child.wait_capture();

    done.store(true, Ordering::Relaxed);
    let _ = heartbeat.join();
    engine
        .registry
        .unregister(&step.run_id, ProcessKind::Step, Some(&step.id));

    outcome
}

fn spawn_heartbeat(
    engine: &Arc<Engine>,
    step: &StepRecord,
    done: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    let engine = engine.clone();
    let run_id = step.run_id.clone();
    let step_id = step.id.clone();
    thread::spawn(move || {
        while !done.load(Ordering::Relaxed) {
            thread::sleep(HEARTBEAT_INTERVAL);
            if done.load(Ordering::Relaxed) {
                break;
            }
            let _ = engine
                .store
                .step_heartbeat(&run_id, &step_id, crate::shared::now_ms());
        }
    })
}

fn record_outcome(engine: &Arc<Engine>, step: &StepRecord, outcome: SpawnOutcome) {
    let status = if outcome.exit_code == 0 {
        StepStatus::Completed
    } else {
        StepStatus::Failed
    };
    let error = (status == StepStatus::Failed)
        .then(|| json!({"message": format!("step exited with code {}", outcome.exit_code)}));

    let applied = engine.store.record_step_result(
        &step.run_id,
        &step.id,
        status,
        error.as_ref(),
        Some(&outcome.stdout),
        Some(&outcome.stderr),
        outcome.duration_ms,
        crate::shared::now_ms(),
    );

    match applied {
        Ok(true) => {
            let (level, log_level, event) = match status {
                StepStatus::Completed => (RunLogLevel::Info, LogLevel::Info, "step.completed"),
                _ => (RunLogLevel::Warn, LogLevel::Info, "step.failed"),
            };
            engine.log(
                log_level,
                event,
                &format!(
                    "run_id={} step_id={} exit_code={} duration_ms={}",
                    step.run_id, step.id, outcome.exit_code, outcome.duration_ms
                ),
            );
            let _ = engine.store.append_run_log(
                &step.run_id,
                RunLogEntity::Step,
                Some(&step.id),
                level,
                &format!(
                    "step {} {} (exit code {})",
                    step.id,
                    status.as_str(),
                    outcome.exit_code
                ),
                None,
            );
        }
        // The row left `running` while the child executed (abort or pause
        // won the race); the recorded state stays as the control op set it.
        Ok(false) => {
            engine.log(
                LogLevel::Debug,
                "step.result.superseded",
                &format!("run_id={} step_id={}", step.run_id, step.id),
            );
        }
        Err(err) => {
            engine.log(
                LogLevel::Error,
                "step.record_failed",
                &format!("run_id={} step_id={} error={err}", step.run_id, step.id),
            );
        }
    }
}
