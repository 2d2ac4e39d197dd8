use maxq::store::runs::ListRunsQuery;
use maxq::store::{NewStep, RunLogEntity, RunLogLevel, RunStatus, StepStatus, Store, StoreError};
use serde_json::{json, Map};
use std::collections::BTreeMap;
use tempfile::tempdir;

fn step(id: &str, depends_on: &[&str]) -> NewStep {
    NewStep {
        id: id.to_string(),
        name: id.to_string(),
        depends_on: depends_on.iter().map(|value| value.to_string()).collect(),
        max_retries: 0,
        env: BTreeMap::new(),
    }
}

fn seed_running_stage(store: &Store, run_id: &str, stage_id: &str, steps: &[NewStep]) {
    store
        .insert_run(run_id, "demo", None, None, 1)
        .expect("insert run");
    store.mark_run_running(run_id, 2).expect("run running");
    store
        .insert_stage(stage_id, run_id, "build", true, 2)
        .expect("insert stage");
    store
        .insert_stage_steps(run_id, stage_id, steps, 3)
        .expect("insert steps");
}

#[test]
fn open_creates_schema_and_reopen_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("maxq.db");
    let store = Store::open(&path).expect("open");
    store.ping().expect("ping");
    drop(store);

    let store = Store::open(&path).expect("reopen");
    store.ping().expect("ping after reopen");
}

#[test]
fn insert_and_load_run_round_trips_payloads() {
    let store = Store::open_in_memory().expect("open");
    let input = json!({"target": "prod", "count": 3});
    let run = store
        .insert_run("run-1", "deploy", Some(&input), None, 100)
        .expect("insert");

    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.flow_name, "deploy");
    assert_eq!(run.input, Some(input));
    assert_eq!(run.created_at, 100);
    assert!(run.started_at.is_none());

    let missing = store.find_run("run-404").expect("query");
    assert!(missing.is_none());
    let err = store.load_run("run-404").expect_err("not found");
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[test]
fn list_runs_filters_sorts_and_paginates() {
    let store = Store::open_in_memory().expect("open");
    for (id, flow, at) in [
        ("run-1", "deploy", 10),
        ("run-2", "deploy", 20),
        ("run-3", "ingest", 30),
    ] {
        store
            .insert_run(id, flow, None, None, at)
            .expect("insert");
    }
    store.mark_run_running("run-3", 31).expect("running");

    let all = store.list_runs(&ListRunsQuery::default()).expect("list");
    assert_eq!(all.total, 3);
    assert_eq!(all.data[0].id, "run-3");

    let deploys = store
        .list_runs(&ListRunsQuery {
            flow_name: Some("deploy".to_string()),
            ..Default::default()
        })
        .expect("list deploy");
    assert_eq!(deploys.total, 2);

    let running = store
        .list_runs(&ListRunsQuery {
            status: Some(RunStatus::Running),
            ..Default::default()
        })
        .expect("list running");
    assert_eq!(running.total, 1);
    assert_eq!(running.data[0].id, "run-3");

    let paged = store
        .list_runs(&ListRunsQuery {
            limit: Some(1),
            offset: Some(1),
            sort_by: Some("created_at".to_string()),
            ..Default::default()
        })
        .expect("page");
    assert_eq!(paged.total, 3);
    assert_eq!(paged.data.len(), 1);
    assert_eq!(paged.data[0].id, "run-2");

    let err = store
        .list_runs(&ListRunsQuery {
            sort_by: Some("id; DROP TABLE run".to_string()),
            ..Default::default()
        })
        .expect_err("reject sort injection");
    assert!(matches!(err, StoreError::InvalidColumn { .. }));
}

#[test]
fn stage_names_are_unique_per_run() {
    let store = Store::open_in_memory().expect("open");
    store
        .insert_run("run-1", "demo", None, None, 1)
        .expect("insert run");
    store
        .insert_stage("stage-1", "run-1", "build", false, 2)
        .expect("first stage");
    let duplicate = store.insert_stage("stage-2", "run-1", "build", false, 3);
    assert!(duplicate.is_err());
}

#[test]
fn claim_is_atomic_and_single_winner() {
    let store = Store::open_in_memory().expect("open");
    seed_running_stage(&store, "run-1", "stage-1", &[step("a", &[])]);

    let candidates = store.claim_candidates(10).expect("candidates");
    assert_eq!(candidates.len(), 1);

    assert!(store
        .try_claim_step("run-1", "a", "worker-1", 50)
        .expect("first claim"));
    assert!(!store
        .try_claim_step("run-1", "a", "worker-2", 51)
        .expect("second claim"));

    let claimed = store.load_step("run-1", "a").expect("load");
    assert_eq!(claimed.status, StepStatus::Running);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
    assert_eq!(claimed.claimed_at, Some(50));
    assert_eq!(claimed.started_at, Some(50));
    assert_eq!(claimed.heartbeat_at, Some(50));
    assert_eq!(store.count_running_steps().expect("count"), 1);
}

#[test]
fn unqueued_steps_are_invisible_to_the_scheduler() {
    let store = Store::open_in_memory().expect("open");
    seed_running_stage(&store, "run-1", "stage-1", &[step("a", &[])]);

    // Pause clears queued_at; resuming the run must not requeue by itself.
    store.pause_run_rows("run-1").expect("pause");
    store.mark_run_running("run-1", 60).expect("rerun");

    let parked = store.load_step("run-1", "a").expect("load");
    assert_eq!(parked.status, StepStatus::Pending);
    assert!(parked.queued_at.is_none());

    assert!(store.claim_candidates(10).expect("candidates").is_empty());
    assert!(!store
        .try_claim_step("run-1", "a", "worker-1", 61)
        .expect("claim attempt"));

    let after = store.load_step("run-1", "a").expect("reload");
    assert!(after.claimed_at.is_none());
    assert_eq!(after.status, StepStatus::Pending);
}

#[test]
fn candidates_exclude_terminated_and_non_running_runs() {
    let store = Store::open_in_memory().expect("open");
    seed_running_stage(&store, "run-1", "stage-1", &[step("a", &[])]);

    store
        .terminate_run_rows("run-1", "aborted", false, 70)
        .expect("terminate");
    assert!(store.claim_candidates(10).expect("candidates").is_empty());

    let run = store.load_run("run-1").expect("load run");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.termination_reason.as_deref(), Some("aborted"));
}

#[test]
fn record_result_only_applies_while_running() {
    let store = Store::open_in_memory().expect("open");
    seed_running_stage(&store, "run-1", "stage-1", &[step("a", &[])]);
    store
        .try_claim_step("run-1", "a", "worker-1", 50)
        .expect("claim");

    let applied = store
        .record_step_result(
            "run-1",
            "a",
            StepStatus::Completed,
            None,
            Some("out"),
            Some(""),
            120,
            60,
        )
        .expect("record");
    assert!(applied);

    let done = store.load_step("run-1", "a").expect("load");
    assert_eq!(done.status, StepStatus::Completed);
    assert_eq!(done.stdout.as_deref(), Some("out"));
    assert_eq!(done.duration_ms, Some(120));

    let again = store
        .record_step_result(
            "run-1",
            "a",
            StepStatus::Failed,
            None,
            None,
            None,
            1,
            61,
        )
        .expect("record again");
    assert!(!again, "terminal rows are never rewritten");
}

#[test]
fn attempt_reset_clears_claim_state_and_bumps_counter() {
    let store = Store::open_in_memory().expect("open");
    let mut failing = step("a", &[]);
    failing.max_retries = 2;
    seed_running_stage(&store, "run-1", "stage-1", &[failing]);
    store
        .try_claim_step("run-1", "a", "worker-1", 50)
        .expect("claim");
    store
        .record_step_result(
            "run-1",
            "a",
            StepStatus::Failed,
            Some(&json!({"message": "exit 1"})),
            Some("partial"),
            Some("boom"),
            10,
            51,
        )
        .expect("fail");

    store.reset_step_attempt("run-1", "a", 52).expect("reset");
    let reset = store.load_step("run-1", "a").expect("load");
    assert_eq!(reset.status, StepStatus::Pending);
    assert_eq!(reset.retry_count, 1);
    assert_eq!(reset.queued_at, Some(52));
    assert!(reset.claimed_at.is_none());
    assert!(reset.worker_id.is_none());
    assert!(reset.stdout.is_none());
    assert!(reset.stderr.is_none());
    assert!(reset.error.is_none());
}

#[test]
fn cascade_marks_dependents_with_skip_reason() {
    let store = Store::open_in_memory().expect("open");
    seed_running_stage(
        &store,
        "run-1",
        "stage-1",
        &[step("a", &[]), step("b", &["a"])],
    );

    store
        .cascade_fail_step("run-1", "b", "a", 90)
        .expect("cascade");
    let skipped = store.load_step("run-1", "b").expect("load");
    assert_eq!(skipped.status, StepStatus::Failed);
    assert!(skipped
        .stderr
        .as_deref()
        .expect("stderr")
        .contains("dependency a failed"));
    assert!(skipped.termination_reason.is_none());
}

#[test]
fn merge_fields_accumulates_and_queries_filter() {
    let store = Store::open_in_memory().expect("open");
    seed_running_stage(
        &store,
        "run-1",
        "stage-1",
        &[step("a", &[]), step("b", &[])],
    );

    let mut first = Map::new();
    first.insert("version".to_string(), json!("1.2.3"));
    store
        .merge_step_fields("run-1", "a", &first)
        .expect("merge first");

    let mut second = Map::new();
    second.insert("digest".to_string(), json!("abc"));
    second.insert("version".to_string(), json!("1.2.4"));
    let merged = store
        .merge_step_fields("run-1", "a", &second)
        .expect("merge second");
    let fields = merged.fields.expect("fields");
    assert_eq!(fields["version"], json!("1.2.4"));
    assert_eq!(fields["digest"], json!("abc"));

    let all = store
        .query_step_fields("run-1", None, None)
        .expect("query all");
    assert_eq!(all.len(), 2);

    let named = store
        .query_step_fields("run-1", None, Some("digest"))
        .expect("query named");
    assert_eq!(named.len(), 1);
    assert_eq!(named[0].step_id, "a");
    assert_eq!(named[0].value, json!("abc"));

    let scoped = store
        .query_step_fields("run-1", Some("b"), None)
        .expect("query scoped");
    assert!(scoped.is_empty());
}

#[test]
fn terminate_is_idempotent() {
    let store = Store::open_in_memory().expect("open");
    seed_running_stage(&store, "run-1", "stage-1", &[step("a", &[])]);

    let first = store
        .terminate_run_rows("run-1", "aborted", false, 80)
        .expect("terminate");
    assert!(first);
    let snapshot = store.load_run("run-1").expect("load");

    let second = store
        .terminate_run_rows("run-1", "aborted", false, 99)
        .expect("terminate again");
    assert!(!second);
    let unchanged = store.load_run("run-1").expect("reload");
    assert_eq!(unchanged.completed_at, snapshot.completed_at);

    let steps = store.steps_for_run("run-1").expect("steps");
    assert!(steps
        .iter()
        .all(|step| step.status == StepStatus::Failed
            && step.termination_reason.as_deref() == Some("aborted")));
}

#[test]
fn retry_reset_preserves_completed_work() {
    let store = Store::open_in_memory().expect("open");
    seed_running_stage(
        &store,
        "run-1",
        "stage-1",
        &[step("a", &[]), step("b", &["a"])],
    );
    store
        .try_claim_step("run-1", "a", "worker-1", 10)
        .expect("claim a");
    store
        .record_step_result("run-1", "a", StepStatus::Completed, None, None, None, 5, 11)
        .expect("complete a");
    store
        .terminate_run_rows("run-1", "aborted", false, 12)
        .expect("abort");

    store.reset_run_rows_for_retry("run-1").expect("retry reset");

    let run = store.load_run("run-1").expect("run");
    assert_eq!(run.status, RunStatus::Pending);
    assert!(run.termination_reason.is_none());

    let a = store.load_step("run-1", "a").expect("a");
    assert_eq!(a.status, StepStatus::Completed);

    let b = store.load_step("run-1", "b").expect("b");
    assert_eq!(b.status, StepStatus::Pending);
    assert_eq!(b.retry_count, 0);
    assert!(b.queued_at.is_none(), "requeue happens on redeclare");
    assert!(b.termination_reason.is_none());
}

#[test]
fn run_log_appends_and_lists_in_order() {
    let store = Store::open_in_memory().expect("open");
    store
        .insert_run("run-1", "demo", None, None, 1)
        .expect("insert run");

    store
        .append_run_log(
            "run-1",
            RunLogEntity::Run,
            None,
            RunLogLevel::Info,
            "run created",
            None,
        )
        .expect("log 1");
    store
        .append_run_log(
            "run-1",
            RunLogEntity::Step,
            Some("a"),
            RunLogLevel::Error,
            "step a failed",
            Some(&json!({"exitCode": 1})),
        )
        .expect("log 2");

    let logs = store.logs_for_run("run-1", 100).expect("list");
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].message, "run created");
    assert_eq!(logs[1].entity_id.as_deref(), Some("a"));
    assert_eq!(logs[1].level, RunLogLevel::Error);
    assert_eq!(logs[1].metadata, Some(json!({"exitCode": 1})));
}

#[test]
fn foreign_keys_are_enforced() {
    let store = Store::open_in_memory().expect("open");
    seed_running_stage(&store, "run-1", "stage-1", &[step("a", &[])]);

    let orphan = store.insert_stage_steps("run-404", "stage-404", &[step("x", &[])], 5);
    assert!(orphan.is_err());
}
