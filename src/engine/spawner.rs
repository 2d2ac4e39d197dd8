use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_LOG_CAPTURE: usize = 8192;

const ENV_DENYLIST: &[&str] = &["PATH", "LD_PRELOAD", "LD_LIBRARY_PATH"];

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub executable: PathBuf,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub max_log_capture: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration_ms: i64,
}

/// Keeps only keys shaped like environment identifiers and drops the
/// loader-control variables a step must never override.
pub fn sanitize_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(key, _)| is_valid_env_key(key) && !is_denied_env_key(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_uppercase() || first == '_') {
        return false;
    }
    chars.all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '_')
}

fn is_denied_env_key(key: &str) -> bool {
    ENV_DENYLIST.contains(&key) || key.starts_with("DYLD_")
}

/// Owner-executable precondition. Advisory where the mode bit means
/// nothing; there the spawn attempt itself is the check.
pub fn validate_executable(path: &Path) -> Result<(), String> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) => return Err(format!("cannot stat: {err}")),
    };
    if !metadata.is_file() {
        return Err("not a regular file".to_string());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o100 == 0 {
            return Err("owner executable bit not set".to_string());
        }
    }
    Ok(())
}

struct CapturedPipe {
    text: String,
    truncated: bool,
}

pub struct ChildProcess {
    child: Child,
    stdout_reader: JoinHandle<CapturedPipe>,
    stderr_reader: JoinHandle<CapturedPipe>,
    max_log_capture: usize,
    started: Instant,
}

impl ChildProcess {
    /// Launches the executable directly, never through a shell, with the
    /// host environment plus the caller's (already sanitized) additions.
    pub fn spawn(request: &SpawnRequest) -> Result<ChildProcess, std::io::Error> {
        let mut command = Command::new(&request.executable);
        command
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &request.env {
            command.env(key, value);
        }

        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("missing stdout pipe"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("missing stderr pipe"))?;

        let cap = request.max_log_capture;
        let stdout_reader = thread::spawn(move || drain_capped(stdout, cap));
        let stderr_reader = thread::spawn(move || drain_capped(stderr, cap));

        Ok(ChildProcess {
            child,
            stdout_reader,
            stderr_reader,
            max_log_capture: cap,
            started: Instant::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Blocks until the child exits, then folds the drained pipes into the
    /// outcome. Signal deaths coerce to a non-zero exit code.
    pub fn wait_capture(mut self) -> SpawnOutcome {
        let status = loop {
            match self.child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(_) => break None,
            }
        };

        let stdout = self
            .stdout_reader
            .join()
            .unwrap_or_else(|_| CapturedPipe {
                text: String::new(),
                truncated: false,
            });
        let stderr = self
            .stderr_reader
            .join()
            .unwrap_or_else(|_| CapturedPipe {
                text: String::new(),
                truncated: false,
            });

        let exit_code = match status {
            Some(status) => coerce_exit_code(status),
            None => 1,
        };

        SpawnOutcome {
            exit_code,
            stdout: finish_capture(&stdout, self.max_log_capture),
            stderr: finish_capture(&stderr, self.max_log_capture),
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            duration_ms: self.started.elapsed().as_millis() as i64,
        }
    }
}

/// Builds the outcome for a child that failed before exec (ENOENT, EACCES).
pub fn spawn_failure_outcome(err: &std::io::Error, started: Instant) -> SpawnOutcome {
    SpawnOutcome {
        exit_code: 1,
        stdout: String::new(),
        stderr: format!("\nProcess error: {err}"),
        stdout_truncated: false,
        stderr_truncated: false,
        duration_ms: started.elapsed().as_millis() as i64,
    }
}

/// Convenience wrapper when the caller has no use for the live handle.
pub fn spawn_capture(request: &SpawnRequest) -> SpawnOutcome {
    let started = Instant::now();
    match ChildProcess::spawn(request) {
        Ok(child) => child.wait_capture(),
        Err(err) => spawn_failure_outcome(&err, started),
    }
}

fn drain_capped(mut pipe: impl Read, cap: usize) -> CapturedPipe {
    let mut kept = Vec::with_capacity(cap.min(4096));
    let mut truncated = false;
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                let budget = cap.saturating_sub(kept.len());
                if budget >= read {
                    kept.extend_from_slice(&chunk[..read]);
                } else {
                    // Partial copy, then keep draining so the child never
                    // blocks on a full pipe.
                    kept.extend_from_slice(&chunk[..budget]);
                    truncated = true;
                }
            }
        }
    }
    CapturedPipe {
        text: String::from_utf8_lossy(&kept).into_owned(),
        truncated,
    }
}

fn finish_capture(pipe: &CapturedPipe, cap: usize) -> String {
    if pipe.truncated {
        format!("{}\n... (output truncated at {cap} bytes)", pipe.text)
    } else {
        pipe.text.clone()
    }
}

#[cfg(unix)]
fn coerce_exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => match status.signal() {
            Some(signal) => 128 + signal,
            None => 1,
        },
    }
}

#[cfg(not(unix))]
fn coerce_exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_identifier_shaped_keys() {
        let mut env = BTreeMap::new();
        env.insert("GOOD_KEY".to_string(), "1".to_string());
        env.insert("_ALSO_GOOD".to_string(), "2".to_string());
        env.insert("lower".to_string(), "3".to_string());
        env.insert("WITH-DASH".to_string(), "4".to_string());
        env.insert("1LEADING".to_string(), "5".to_string());
        let kept = sanitize_env(&env);
        assert_eq!(
            kept.keys().collect::<Vec<_>>(),
            vec!["GOOD_KEY", "_ALSO_GOOD"]
        );
    }

    #[test]
    fn sanitize_drops_loader_control_variables() {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/tmp".to_string());
        env.insert("LD_PRELOAD".to_string(), "x.so".to_string());
        env.insert("LD_LIBRARY_PATH".to_string(), "/lib".to_string());
        env.insert("DYLD_INSERT_LIBRARIES".to_string(), "y.dylib".to_string());
        env.insert("SAFE".to_string(), "ok".to_string());
        let kept = sanitize_env(&env);
        assert_eq!(kept.keys().collect::<Vec<_>>(), vec!["SAFE"]);
    }
}
