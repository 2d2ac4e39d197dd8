use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOptions {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub flows: Option<PathBuf>,
    pub max_concurrent_steps: Option<usize>,
    pub max_log_capture: Option<usize>,
    pub scheduler_interval_ms: Option<u64>,
    pub scheduler_batch_size: Option<usize>,
    pub abort_grace_ms: Option<u64>,
    pub log_level: Option<String>,
    pub help: bool,
}

pub fn parse_cli_options(args: &[String]) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => options.help = true,
            "--port" => options.port = Some(parse_value(arg, iter.next())?),
            "--data-dir" => options.data_dir = Some(PathBuf::from(required(arg, iter.next())?)),
            "--flows" => options.flows = Some(PathBuf::from(required(arg, iter.next())?)),
            "--max-concurrent-steps" => {
                options.max_concurrent_steps = Some(parse_value(arg, iter.next())?)
            }
            "--max-log-capture" => options.max_log_capture = Some(parse_value(arg, iter.next())?),
            "--scheduler-interval" => {
                options.scheduler_interval_ms = Some(parse_value(arg, iter.next())?)
            }
            "--scheduler-batch-size" => {
                options.scheduler_batch_size = Some(parse_value(arg, iter.next())?)
            }
            "--abort-grace-ms" => options.abort_grace_ms = Some(parse_value(arg, iter.next())?),
            "--log-level" => options.log_level = Some(required(arg, iter.next())?.to_string()),
            other => return Err(format!("unknown argument `{other}`; try --help")),
        }
    }
    Ok(options)
}

fn required<'a>(flag: &str, value: Option<&'a String>) -> Result<&'a str, String> {
    value
        .map(|value| value.as_str())
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> Result<T, String> {
    let raw = required(flag, value)?;
    raw.parse::<T>()
        .map_err(|_| format!("invalid value `{raw}` for {flag}"))
}

pub fn help_text() -> String {
    [
        "Usage: maxq [options]",
        "",
        "Options:",
        "  --port N                   HTTP listen port (default 6330)",
        "  --data-dir PATH            State directory (default ~/.maxq)",
        "  --flows PATH               Flows root directory (default ./flows)",
        "  --max-concurrent-steps N   Global running-step cap (default 10)",
        "  --max-log-capture N        Per-stream capture cap in bytes (default 8192)",
        "  --scheduler-interval MS    Scheduler poll interval (default 200)",
        "  --scheduler-batch-size N   Max claims per tick (default 10)",
        "  --abort-grace-ms MS        SIGTERM grace before SIGKILL (default 5000)",
        "  --log-level LEVEL          debug, info, warn or error (default info)",
        "  --help                     Show this help",
    ]
    .join("\n")
}
