use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to build async runtime: {0}")]
    AsyncRuntime(String),
    #[error("failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },
    #[error("server thread exited before reporting its address")]
    ServerStartup,
}
