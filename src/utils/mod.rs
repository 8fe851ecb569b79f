//! Shared helpers for logging, environment, time and fault containment

pub mod env;
pub mod error;
pub mod logging;
pub mod time;
pub mod timeout;

// Re-export commonly used items
pub use env::{env_bool, env_int, env_opt};
pub use error::{contain_panic, log_error, panic_message};
pub use logging::{init_logging, init_logging_from_config};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use time::{current_timestamp, current_timestamp_millis};
pub use timeout::{call_with_timeout, TimedOut};
