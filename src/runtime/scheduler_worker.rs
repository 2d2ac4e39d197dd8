use super::sleep_with_stop;
use crate::engine::{scheduler, Engine};
use crate::shared::LogLevel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// The single polling loop that drives step claims. One per process; ticks
/// until the stop flag flips, then exits after the current pass.
pub fn spawn_scheduler_worker(engine: Arc<Engine>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::spawn(move || {
        engine.log(LogLevel::Info, "scheduler.started", "polling loop up");
        let interval = Duration::from_millis(engine.settings.scheduler_interval_ms);
        while !stop.load(Ordering::Relaxed) {
            match scheduler::scheduler_tick(&engine) {
                Ok(_) => {}
                Err(err) => {
                    engine.log(
                        LogLevel::Error,
                        "scheduler.tick_failed",
                        &err.to_string(),
                    );
                }
            }
            if !sleep_with_stop(&stop, interval) {
                break;
            }
        }
        engine.log(LogLevel::Info, "scheduler.stopped", "polling loop down");
    })
}
