use crate::flows::FlowsError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Flows(#[from] FlowsError),
    #[error("flow `{flow_name}` is not available: {reason}")]
    FlowUnavailable { flow_name: String, reason: String },
    #[error("run `{run_id}` is {status}; {operation} is not allowed")]
    Conflict {
        run_id: String,
        status: &'static str,
        operation: &'static str,
    },
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("step `{step_id}` is {status}; retry requires a failed step")]
    StepNotRetryable { step_id: String, status: String },
}

impl EngineError {
    /// Collapses the store's not-found into the engine's, so callers see
    /// one shape regardless of which layer noticed.
    pub fn normalize(self) -> Self {
        match self {
            EngineError::Store(StoreError::NotFound { entity, id }) => {
                EngineError::NotFound { entity, id }
            }
            other => other,
        }
    }
}
