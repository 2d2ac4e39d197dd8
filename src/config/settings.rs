use super::paths::default_data_dir;
use super::ConfigError;
use crate::app::cli::CliOptions;
use crate::shared::LogLevel;
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 6330;
pub const DEFAULT_MAX_CONCURRENT_STEPS: usize = 10;
pub const DEFAULT_MAX_LOG_CAPTURE: usize = 8192;
pub const DEFAULT_SCHEDULER_INTERVAL_MS: u64 = 200;
pub const DEFAULT_SCHEDULER_BATCH_SIZE: usize = 10;
pub const DEFAULT_ABORT_GRACE_MS: u64 = 5000;

/// Fully resolved server configuration.
///
/// Resolution order is CLI flag, then environment variable, then default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub flows_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub max_concurrent_steps: usize,
    pub max_log_capture: usize,
    pub scheduler_interval_ms: u64,
    pub scheduler_batch_size: usize,
    pub abort_grace_ms: u64,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub log_level: LogLevel,
}

impl Settings {
    pub fn resolve(cli: &CliOptions) -> Result<Self, ConfigError> {
        let data_dir = match cli.data_dir.clone() {
            Some(path) => path,
            None => match env_string("MAXQ_DATA_DIR") {
                Some(raw) => PathBuf::from(raw),
                None => default_data_dir()?,
            },
        };

        let flows_root = cli
            .flows
            .clone()
            .or_else(|| env_string("MAXQ_FLOWS_ROOT").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./flows"));

        let host = env_string("MAXQ_SERVER_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = match cli.port {
            Some(port) => port,
            None => env_number("MAXQ_SERVER_PORT", u64::from(DEFAULT_PORT))? as u16,
        };

        let max_concurrent_steps = resolve_positive(
            "max_concurrent_steps",
            cli.max_concurrent_steps.map(|v| v as u64),
            "MAXQ_MAX_CONCURRENT_STEPS",
            DEFAULT_MAX_CONCURRENT_STEPS as u64,
        )? as usize;
        let max_log_capture = resolve_positive(
            "max_log_capture",
            cli.max_log_capture.map(|v| v as u64),
            "MAXQ_MAX_LOG_CAPTURE",
            DEFAULT_MAX_LOG_CAPTURE as u64,
        )? as usize;
        let scheduler_interval_ms = resolve_positive(
            "scheduler_interval_ms",
            cli.scheduler_interval_ms,
            "MAXQ_SCHEDULER_INTERVAL_MS",
            DEFAULT_SCHEDULER_INTERVAL_MS,
        )?;
        let scheduler_batch_size = resolve_positive(
            "scheduler_batch_size",
            cli.scheduler_batch_size.map(|v| v as u64),
            "MAXQ_SCHEDULER_BATCH_SIZE",
            DEFAULT_SCHEDULER_BATCH_SIZE as u64,
        )? as usize;
        let abort_grace_ms = resolve_positive(
            "abort_grace_ms",
            cli.abort_grace_ms,
            "MAXQ_ABORT_GRACE_MS",
            DEFAULT_ABORT_GRACE_MS,
        )?;

        let log_level_raw = cli
            .log_level
            .clone()
            .or_else(|| env_string("LOG_LEVEL"))
            .unwrap_or_else(|| "info".to_string());
        let log_level =
            LogLevel::parse(&log_level_raw).map_err(|reason| ConfigError::InvalidValue {
                name: "log_level".to_string(),
                value: log_level_raw,
                reason,
            })?;

        Ok(Self {
            data_dir,
            flows_root,
            host,
            port,
            max_concurrent_steps,
            max_log_capture,
            scheduler_interval_ms,
            scheduler_batch_size,
            abort_grace_ms,
            api_url: env_string("MAXQ_API_URL"),
            api_key: env_string("MAXQ_API_KEY"),
            log_level,
        })
    }

    /// The base URL flow and step scripts reach the server at, exported to
    /// children as `MAXQ_API`.
    pub fn resolved_api_url(&self) -> String {
        match &self.api_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}/api/v1", self.host, self.port),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_number(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env_string(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw,
            reason: "expected a non-negative integer".to_string(),
        }),
    }
}

fn resolve_positive(
    name: &str,
    cli_value: Option<u64>,
    env_name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let value = match cli_value {
        Some(value) => value,
        None => env_number(env_name, default)?,
    };
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
