pub mod error;
pub mod scheduler_worker;

pub use error::RuntimeError;
pub use scheduler_worker::spawn_scheduler_worker;

use crate::config::{bootstrap_data_dir, DataPaths, Settings};
use crate::engine::{reconcile, Engine};
use crate::server::build_router;
use crate::shared::LogLevel;
use crate::store::Store;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A fully started MaxQ instance: store opened and reconciled, scheduler
/// worker polling, HTTP listener bound. Tests run several of these side by
/// side on port 0.
pub struct RunningServer {
    engine: Arc<Engine>,
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    scheduler_handle: Option<JoinHandle<()>>,
    server_handle: Option<JoinHandle<()>>,
}

pub fn start_server(settings: Settings) -> Result<RunningServer, RuntimeError> {
    let paths = DataPaths::new(settings.data_dir.clone());
    bootstrap_data_dir(&paths)?;
    let store = Store::open(&paths.database_path())?;
    let engine = Arc::new(Engine::new(store, settings));

    reconcile::reconcile_on_startup(&engine)?;

    let stop = Arc::new(AtomicBool::new(false));
    let scheduler_handle = spawn_scheduler_worker(engine.clone(), stop.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let (addr_tx, addr_rx) = mpsc::channel::<Result<SocketAddr, RuntimeError>>();
    let bind_host = engine.settings.host.clone();
    let bind_port = engine.settings.port;
    let router_engine = engine.clone();

    let server_handle = thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                let _ = addr_tx.send(Err(RuntimeError::AsyncRuntime(err.to_string())));
                return;
            }
        };
        runtime.block_on(async move {
            let listener =
                match tokio::net::TcpListener::bind((bind_host.as_str(), bind_port)).await {
                    Ok(listener) => listener,
                    Err(err) => {
                        let _ = addr_tx.send(Err(RuntimeError::Bind {
                            addr: format!("{bind_host}:{bind_port}"),
                            message: err.to_string(),
                        }));
                        return;
                    }
                };
            let addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    let _ = addr_tx.send(Err(RuntimeError::Bind {
                        addr: format!("{bind_host}:{bind_port}"),
                        message: err.to_string(),
                    }));
                    return;
                }
            };
            let _ = addr_tx.send(Ok(addr));

            let router = build_router(router_engine.clone());
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                router_engine.log(LogLevel::Error, "server.exited", &err.to_string());
            }
        });
    });

    let addr = addr_rx
        .recv()
        .map_err(|_| RuntimeError::ServerStartup)??;

    engine.log(
        LogLevel::Info,
        "server.started",
        &format!("addr={addr} worker_id={}", engine.worker_id),
    );

    Ok(RunningServer {
        engine,
        addr,
        stop,
        shutdown_tx: Some(shutdown_tx),
        scheduler_handle: Some(scheduler_handle),
        server_handle: Some(server_handle),
    })
}

impl RunningServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.engine.clone()
    }

    /// Stops the listener and the scheduler worker and joins both threads.
    /// In-flight step executor threads observe terminal rows and drain on
    /// their own.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.scheduler_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.join();
        }
        self.engine
            .log(LogLevel::Info, "server.stopped", "clean shutdown");
    }
}

/// Blocks until SIGINT or SIGTERM.
pub fn wait_for_shutdown_signal() -> Result<(), RuntimeError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| RuntimeError::AsyncRuntime(err.to_string()))?;
    runtime.block_on(async {
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(term) => term,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    });
    Ok(())
}

pub(crate) fn sleep_with_stop(stop: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::from_millis(0) {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(Duration::from_millis(100));
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !stop.load(Ordering::Relaxed)
}
