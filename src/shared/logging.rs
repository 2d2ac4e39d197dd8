use crate::config::DataPaths;
use std::fs;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!(
                "unknown log level `{other}`; expected debug, info, warn or error"
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Appends one JSON line to `<data_dir>/logs/server.log`.
///
/// Logging is fire-and-forget: any failure to serialize or write is
/// swallowed so a full disk never takes the engine down with it.
pub fn append_server_log(
    paths: &DataPaths,
    min_level: LogLevel,
    level: LogLevel,
    event: &str,
    message: &str,
) {
    if level < min_level {
        return;
    }
    let path = paths.server_log_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let payload = serde_json::json!({
        "timestamp": crate::shared::now_ms(),
        "level": level.as_str(),
        "event": event,
        "message": message,
    });

    let Ok(line) = serde_json::to_string(&payload) else {
        return;
    };

    let _ = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(format!("{line}\n").as_bytes()));
}

#[cfg(test)]
mod tests {
    use super::LogLevel;

    #[test]
    fn levels_order_from_debug_to_error() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn parse_rejects_unknown_level() {
        let err = LogLevel::parse("verbose").expect_err("must reject");
        assert!(err.contains("verbose"));
    }
}
