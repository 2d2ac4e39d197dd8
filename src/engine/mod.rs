pub mod dag;
pub mod error;
pub mod flow_runner;
pub mod orchestrator;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod spawner;
pub mod step_runner;

pub use error::EngineError;
pub use flow_runner::{FlowCallback, FlowOutcome, FlowResponse, FlowStepDecl};
pub use orchestrator::{AbortResult, PauseResult, RetryStepResult};
pub use registry::{ProcessKind, ProcessRegistry};
pub use scheduler::TickOutcome;
pub use spawner::{sanitize_env, spawn_capture, SpawnOutcome, SpawnRequest};

use crate::config::{DataPaths, Settings};
use crate::shared::logging::append_server_log;
use crate::shared::LogLevel;
use crate::store::Store;

/// Shared engine context: the store, the live-process index and the
/// resolved settings. Everything is passed through this value explicitly so
/// tests can run several engines side by side in one process.
pub struct Engine {
    pub store: Store,
    pub registry: ProcessRegistry,
    pub settings: Settings,
    pub paths: DataPaths,
    pub worker_id: String,
}

impl Engine {
    pub fn new(store: Store, settings: Settings) -> Self {
        let paths = DataPaths::new(settings.data_dir.clone());
        let worker_id = crate::shared::new_id("worker");
        Self {
            store,
            registry: ProcessRegistry::default(),
            settings,
            paths,
            worker_id,
        }
    }

    pub(crate) fn log(&self, level: LogLevel, event: &str, message: &str) {
        append_server_log(&self.paths, self.settings.log_level, level, event, message);
    }
}
