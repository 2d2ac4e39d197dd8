use maxq::config::Settings;
use maxq::engine::scheduler::scheduler_tick;
use maxq::engine::Engine;
use maxq::shared::LogLevel;
use maxq::store::{NewStep, StepStatus, Store};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn test_settings(root: &Path, max_concurrent: usize) -> Settings {
    Settings {
        data_dir: root.join("data"),
        flows_root: root.join("flows"),
        host: "127.0.0.1".to_string(),
        port: 0,
        max_concurrent_steps: max_concurrent,
        max_log_capture: 8192,
        scheduler_interval_ms: 25,
        scheduler_batch_size: 10,
        abort_grace_ms: 500,
        api_url: None,
        api_key: None,
        log_level: LogLevel::Error,
    }
}

fn write_script(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("script dir");
    }
    fs::write(path, body).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("chmod");
    }
}

fn step(id: &str, depends_on: &[&str]) -> NewStep {
    NewStep {
        id: id.to_string(),
        name: id.to_string(),
        depends_on: depends_on.iter().map(|value| value.to_string()).collect(),
        max_retries: 0,
        env: BTreeMap::new(),
    }
}

fn engine_with_stage(
    root: &Path,
    max_concurrent: usize,
    steps: &[NewStep],
    step_body: &str,
) -> Arc<Engine> {
    let settings = test_settings(root, max_concurrent);
    for decl in steps {
        write_script(
            &settings
                .flows_root
                .join("demo/steps")
                .join(&decl.name)
                .join("step.sh"),
            step_body,
        );
    }
    let store = Store::open_in_memory().expect("store");
    store
        .insert_run("run-1", "demo", None, None, 1)
        .expect("insert run");
    store.mark_run_running("run-1", 2).expect("run running");
    store
        .insert_stage("stage-1", "run-1", "build", true, 2)
        .expect("insert stage");
    store
        .insert_stage_steps("run-1", "stage-1", steps, 3)
        .expect("insert steps");
    Arc::new(Engine::new(store, settings))
}

fn wait_for_status(engine: &Arc<Engine>, step_id: &str, wanted: StepStatus) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let step = engine.store.load_step("run-1", step_id).expect("load step");
        if step.status == wanted {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "step {step_id} stuck in {:?}",
            step.status
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn tick_claims_only_dependency_satisfied_steps() {
    let dir = tempdir().expect("tempdir");
    let engine = engine_with_stage(
        dir.path(),
        10,
        &[step("a", &[]), step("b", &["a"])],
        "#!/bin/sh\nexit 0\n",
    );

    let first = scheduler_tick(&engine).expect("tick");
    assert_eq!(first.claimed, 1);

    wait_for_status(&engine, "a", StepStatus::Completed);
    let b_before = engine.store.load_step("run-1", "b").expect("load b");
    assert_eq!(b_before.status, StepStatus::Pending);

    let second = scheduler_tick(&engine).expect("tick");
    assert_eq!(second.claimed, 1);
    wait_for_status(&engine, "b", StepStatus::Completed);
}

#[test]
fn tick_respects_the_concurrency_cap() {
    let dir = tempdir().expect("tempdir");
    let engine = engine_with_stage(
        dir.path(),
        1,
        &[step("a", &[]), step("b", &[])],
        "#!/bin/sh\nexec sleep 0.4\n",
    );

    let first = scheduler_tick(&engine).expect("tick");
    assert_eq!(first.claimed, 1);

    let while_busy = scheduler_tick(&engine).expect("tick while busy");
    assert_eq!(while_busy.claimed, 0);
    assert!(while_busy.at_capacity);
    assert!(engine.store.count_running_steps().expect("count") <= 1);

    wait_for_status(&engine, "a", StepStatus::Completed);
    let third = scheduler_tick(&engine).expect("third tick");
    assert_eq!(third.claimed, 1);
    wait_for_status(&engine, "b", StepStatus::Completed);
}

#[test]
fn tick_batches_up_to_the_configured_size() {
    let dir = tempdir().expect("tempdir");
    let mut settings_probe = test_settings(dir.path(), 10);
    settings_probe.scheduler_batch_size = 2;

    let steps = [step("a", &[]), step("b", &[]), step("c", &[])];
    for decl in &steps {
        write_script(
            &settings_probe
                .flows_root
                .join("demo/steps")
                .join(&decl.name)
                .join("step.sh"),
            "#!/bin/sh\nexit 0\n",
        );
    }
    let store = Store::open_in_memory().expect("store");
    store
        .insert_run("run-1", "demo", None, None, 1)
        .expect("insert run");
    store.mark_run_running("run-1", 2).expect("run running");
    store
        .insert_stage("stage-1", "run-1", "build", true, 2)
        .expect("insert stage");
    store
        .insert_stage_steps("run-1", "stage-1", &steps, 3)
        .expect("insert steps");
    let engine = Arc::new(Engine::new(store, settings_probe));

    let tick = scheduler_tick(&engine).expect("tick");
    assert_eq!(tick.claimed, 2, "batch size bounds one tick");
}

#[test]
fn failed_dependency_blocks_dependents_from_claims() {
    let dir = tempdir().expect("tempdir");
    let engine = engine_with_stage(
        dir.path(),
        10,
        &[step("a", &[]), step("b", &["a"])],
        "#!/bin/sh\nexit 1\n",
    );

    scheduler_tick(&engine).expect("tick");
    wait_for_status(&engine, "a", StepStatus::Failed);

    let after = scheduler_tick(&engine).expect("tick after failure");
    assert_eq!(after.claimed, 0);
    let b = engine.store.load_step("run-1", "b").expect("load b");
    assert_eq!(b.status, StepStatus::Pending);
    assert!(b.claimed_at.is_none());
}
