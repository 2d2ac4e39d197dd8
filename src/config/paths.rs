use super::ConfigError;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![self.root.clone(), self.root.join("logs")]
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join("maxq.db")
    }

    pub fn server_log_path(&self) -> PathBuf {
        self.root.join("logs/server.log")
    }
}

pub const DEFAULT_DATA_DIR: &str = ".maxq";

pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
    let home = std::env::var_os("HOME").ok_or(ConfigError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(home).join(DEFAULT_DATA_DIR))
}

pub fn bootstrap_data_dir(paths: &DataPaths) -> Result<(), ConfigError> {
    for path in paths.required_directories() {
        fs::create_dir_all(&path).map_err(|source| ConfigError::CreateDir {
            path: path.display().to_string(),
            source,
        })?;
    }
    Ok(())
}
