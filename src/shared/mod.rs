pub mod ids;
pub mod logging;
pub mod time;

pub use ids::new_id;
pub use logging::LogLevel;
pub use time::now_ms;
