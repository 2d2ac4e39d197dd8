use super::orchestrator::TERMINATION_SERVER_RESTART;
use super::{Engine, EngineError};
use crate::shared::{now_ms, LogLevel};
use crate::store::{RunLogEntity, RunLogLevel, RunStatus};

/// Startup reconciliation: no child process survives a restart of this
/// server, so every run still marked `running` is failed with
/// `termination_reason=server_restart` and its claim fields cleared. Runs
/// before the listener binds.
pub fn reconcile_on_startup(engine: &Engine) -> Result<usize, EngineError> {
    let stranded = engine.store.run_ids_with_status(RunStatus::Running)?;
    for run_id in &stranded {
        engine
            .store
            .terminate_run_rows(run_id, TERMINATION_SERVER_RESTART, true, now_ms())?;
        let _ = engine.store.append_run_log(
            run_id,
            RunLogEntity::Run,
            None,
            RunLogLevel::Error,
            "run failed: server restarted while the run was in flight",
            None,
        );
        engine.log(
            LogLevel::Warn,
            "reconcile.run_failed",
            &format!("run_id={run_id}"),
        );
    }
    if !stranded.is_empty() {
        engine.log(
            LogLevel::Info,
            "reconcile.completed",
            &format!("reconciled={}", stranded.len()),
        );
    }
    Ok(stranded.len())
}
