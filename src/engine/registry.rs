use std::collections::BTreeMap;
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Flow,
    Step,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredProcess {
    pub pid: u32,
    pub kind: ProcessKind,
    pub step_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillReport {
    pub signaled: usize,
    pub escalated: usize,
}

/// In-memory index of live children, keyed `<run_id>:flow` or
/// `<run_id>:step:<step_id>`. It is a weak index: entries describe OS
/// processes, the persisted rows stay authoritative.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    inner: Mutex<BTreeMap<String, RegisteredProcess>>,
}

fn registry_key(run_id: &str, kind: ProcessKind, step_id: Option<&str>) -> String {
    match kind {
        ProcessKind::Flow => format!("{run_id}:flow"),
        ProcessKind::Step => format!("{run_id}:step:{}", step_id.unwrap_or_default()),
    }
}

impl ProcessRegistry {
    pub fn register(&self, run_id: &str, kind: ProcessKind, pid: u32, step_id: Option<&str>) {
        let key = registry_key(run_id, kind, step_id);
        let mut inner = self.lock();
        inner.insert(
            key,
            RegisteredProcess {
                pid,
                kind,
                step_id: step_id.map(|value| value.to_string()),
            },
        );
    }

    pub fn unregister(&self, run_id: &str, kind: ProcessKind, step_id: Option<&str>) {
        let key = registry_key(run_id, kind, step_id);
        let mut inner = self.lock();
        inner.remove(&key);
    }

    pub fn processes_for_run(&self, run_id: &str) -> Vec<RegisteredProcess> {
        let prefix = format!("{run_id}:");
        let inner = self.lock();
        inner
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, process)| process.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// SIGTERM every live child of the run, wait out the grace period, then
    /// SIGKILL the stragglers. Entries are unregistered afterwards
    /// regardless; failures to signal never propagate.
    pub fn kill_processes_for_run(&self, run_id: &str, grace: Duration) -> KillReport {
        let processes = self.processes_for_run(run_id);
        let live: Vec<u32> = processes
            .iter()
            .map(|process| process.pid)
            .filter(|pid| is_process_alive(*pid))
            .collect();

        for pid in &live {
            send_signal(*pid, "-TERM");
        }

        let deadline = Instant::now() + grace;
        let mut remaining: Vec<u32> = live.clone();
        while !remaining.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(100));
            remaining.retain(|pid| is_process_alive(*pid));
        }

        for pid in &remaining {
            send_signal(*pid, "-KILL");
        }

        let prefix = format!("{run_id}:");
        let mut inner = self.lock();
        inner.retain(|key, _| !key.starts_with(&prefix));

        KillReport {
            signaled: live.len(),
            escalated: remaining.len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, RegisteredProcess>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        false
    }
}

fn send_signal(pid: u32, signal: &str) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg(signal)
            .arg(pid.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_prefix_lookup() {
        let registry = ProcessRegistry::default();
        registry.register("run-1", ProcessKind::Flow, 100, None);
        registry.register("run-1", ProcessKind::Step, 101, Some("a"));
        registry.register("run-2", ProcessKind::Step, 102, Some("b"));

        let processes = registry.processes_for_run("run-1");
        assert_eq!(processes.len(), 2);
        assert_eq!(registry.processes_for_run("run-2").len(), 1);
        assert_eq!(registry.processes_for_run("run-3").len(), 0);
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ProcessRegistry::default();
        registry.register("run-1", ProcessKind::Step, 100, Some("a"));
        registry.unregister("run-1", ProcessKind::Step, Some("a"));
        registry.unregister("run-1", ProcessKind::Step, Some("a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn run_prefix_does_not_match_other_runs() {
        let registry = ProcessRegistry::default();
        registry.register("run-1", ProcessKind::Flow, 100, None);
        registry.register("run-10", ProcessKind::Flow, 101, None);
        assert_eq!(registry.processes_for_run("run-1").len(), 1);
    }

    #[test]
    fn kill_with_no_live_processes_reports_zero() {
        let registry = ProcessRegistry::default();
        registry.register("run-1", ProcessKind::Step, 0, Some("a"));
        let report = registry.kill_processes_for_run("run-1", Duration::from_millis(10));
        assert_eq!(report.signaled, 0);
        assert_eq!(report.escalated, 0);
        assert!(registry.is_empty());
    }
}
