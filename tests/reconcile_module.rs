use maxq::config::Settings;
use maxq::engine::{reconcile, Engine};
use maxq::shared::LogLevel;
use maxq::store::{NewStep, RunStatus, StepStatus, Store};
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::tempdir;

fn test_settings(root: &Path) -> Settings {
    Settings {
        data_dir: root.join("data"),
        flows_root: root.join("flows"),
        host: "127.0.0.1".to_string(),
        port: 0,
        max_concurrent_steps: 4,
        max_log_capture: 8192,
        scheduler_interval_ms: 25,
        scheduler_batch_size: 4,
        abort_grace_ms: 100,
        api_url: None,
        api_key: None,
        log_level: LogLevel::Error,
    }
}

fn step(id: &str) -> NewStep {
    NewStep {
        id: id.to_string(),
        name: id.to_string(),
        depends_on: Vec::new(),
        max_retries: 0,
        env: BTreeMap::new(),
    }
}

#[test]
fn startup_fails_stranded_runs_with_server_restart() {
    let dir = tempdir().expect("tempdir");
    let db = dir.path().join("maxq.db");

    // Simulate a previous process that died mid-run.
    {
        let store = Store::open(&db).expect("open");
        store
            .insert_run("run-1", "demo", None, None, 1)
            .expect("insert run");
        store.mark_run_running("run-1", 2).expect("run running");
        store
            .insert_stage("stage-1", "run-1", "build", true, 2)
            .expect("stage");
        store
            .insert_stage_steps("run-1", "stage-1", &[step("a"), step("b")], 3)
            .expect("steps");
        store
            .try_claim_step("run-1", "a", "worker-dead", 4)
            .expect("claim");

        store
            .insert_run("run-2", "demo", None, None, 5)
            .expect("insert run 2");
    }

    let store = Store::open(&db).expect("reopen");
    let engine = Engine::new(store, test_settings(dir.path()));
    let reconciled = reconcile::reconcile_on_startup(&engine).expect("reconcile");
    assert_eq!(reconciled, 1);

    let run = engine.store.load_run("run-1").expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.termination_reason.as_deref(), Some("server_restart"));

    for step_id in ["a", "b"] {
        let step = engine.store.load_step("run-1", step_id).expect("step");
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.termination_reason.as_deref(), Some("server_restart"));
        assert!(step.claimed_at.is_none(), "claim fields cleared");
        assert!(step.worker_id.is_none());
        assert!(step.heartbeat_at.is_none());
    }

    // Untouched pending run stays pending.
    let other = engine.store.load_run("run-2").expect("run 2");
    assert_eq!(other.status, RunStatus::Pending);

    // No terminal run keeps pending or running steps behind.
    let steps = engine.store.steps_for_run("run-1").expect("steps");
    assert!(steps.iter().all(|step| step.status.is_terminal()));

    // A second pass finds nothing to do.
    let again = reconcile::reconcile_on_startup(&engine).expect("second pass");
    assert_eq!(again, 0);
}
