use maxq::engine::registry::{is_process_alive, ProcessKind, ProcessRegistry};
use maxq::engine::spawner::{ChildProcess, SpawnRequest};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("chmod");
    }
}

fn spawn_script(dir: &Path, name: &str, body: &str) -> ChildProcess {
    let script = dir.join(name);
    write_script(&script, body);
    ChildProcess::spawn(&SpawnRequest {
        executable: script,
        cwd: dir.to_path_buf(),
        env: BTreeMap::new(),
        max_log_capture: 1024,
    })
    .expect("spawn")
}

#[cfg(unix)]
#[test]
fn sigterm_stops_a_cooperative_child() {
    let dir = tempdir().expect("tempdir");
    let child = spawn_script(dir.path(), "sleeper.sh", "#!/bin/sh\nexec sleep 30\n");
    let pid = child.pid();
    assert!(is_process_alive(pid));

    let registry = ProcessRegistry::default();
    registry.register("run-1", ProcessKind::Step, pid, Some("a"));

    let report = registry.kill_processes_for_run("run-1", Duration::from_millis(2000));
    assert_eq!(report.signaled, 1);
    assert_eq!(report.escalated, 0);
    assert!(!is_process_alive(pid));
    assert!(registry.is_empty());
}

#[cfg(unix)]
#[test]
fn stubborn_child_is_escalated_to_sigkill() {
    let dir = tempdir().expect("tempdir");
    let child = spawn_script(
        dir.path(),
        "stubborn.sh",
        "#!/bin/sh\ntrap '' TERM\nwhile true; do sleep 1; done\n",
    );
    let pid = child.pid();
    assert!(is_process_alive(pid));

    let registry = ProcessRegistry::default();
    registry.register("run-1", ProcessKind::Step, pid, Some("a"));

    let report = registry.kill_processes_for_run("run-1", Duration::from_millis(300));
    assert_eq!(report.signaled, 1);
    assert_eq!(report.escalated, 1);

    // SIGKILL delivery is asynchronous; give it a moment.
    let mut waited = 0;
    while is_process_alive(pid) && waited < 2000 {
        std::thread::sleep(Duration::from_millis(50));
        waited += 50;
    }
    assert!(!is_process_alive(pid));
}

#[test]
fn kill_for_one_run_leaves_other_runs_alone() {
    let dir = tempdir().expect("tempdir");
    let survivor = spawn_script(dir.path(), "survivor.sh", "#!/bin/sh\nexec sleep 5\n");
    let survivor_pid = survivor.pid();

    let registry = ProcessRegistry::default();
    registry.register("run-2", ProcessKind::Step, survivor_pid, Some("b"));

    let report = registry.kill_processes_for_run("run-1", Duration::from_millis(100));
    assert_eq!(report.signaled, 0);
    assert_eq!(registry.processes_for_run("run-2").len(), 1);

    registry.kill_processes_for_run("run-2", Duration::from_millis(2000));
}
