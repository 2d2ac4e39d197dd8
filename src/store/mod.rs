pub mod control;
pub mod error;
mod migrations;
pub mod run_logs;
pub mod runs;
pub mod stages;
pub mod steps;

pub use error::StoreError;
pub use run_logs::{RunLogEntity, RunLogLevel, RunLogRecord};
pub use runs::{ListRunsQuery, RunPage, RunRecord, RunStatus, SortOrder};
pub use stages::{StageRecord, StageStatus};
pub use steps::{NewStep, StepFieldEntry, StepRecord, StepStatus};

use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handle to the embedded SQLite store. Cloning is cheap; all clones share
/// one connection guarded by a mutex, which serializes writes the same way
/// the single-writer model in the scheduler expects.
#[derive(Clone)]
pub struct Store {
    connection: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let connection = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::bootstrap(connection)
    }

    /// In-memory store for tests; same schema and pragmas as the file store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let connection = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: ":memory:".to_string(),
            source,
        })?;
        Self::bootstrap(connection)
    }

    fn bootstrap(mut connection: Connection) -> Result<Self, StoreError> {
        // journal_mode and busy_timeout report their new value as a row.
        connection
            .query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(StoreError::sql)?;
        connection
            .query_row("PRAGMA busy_timeout=5000", [], |_| Ok(()))
            .map_err(StoreError::sql)?;
        connection
            .execute_batch("PRAGMA foreign_keys=ON; PRAGMA synchronous=NORMAL;")
            .map_err(StoreError::sql)?;
        migrations::apply_migrations(&mut connection)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Liveness probe for the health endpoint.
    pub fn ping(&self) -> Result<(), StoreError> {
        let connection = self.lock();
        connection
            .query_row("SELECT 1", [], |_| Ok(()))
            .map_err(StoreError::sql)
    }
}

pub(crate) fn json_to_text(value: Option<&serde_json::Value>) -> Option<String> {
    value.map(|value| value.to_string())
}
