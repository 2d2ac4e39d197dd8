#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to resolve home directory for the default data dir")]
    HomeDirectoryUnavailable,
    #[error("invalid value for {name}: `{value}` ({reason})")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
    #[error("flows root {path} is not a directory")]
    FlowsRootMissing { path: String },
}
