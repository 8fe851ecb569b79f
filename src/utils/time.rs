//! Time utilities
//!
//! Provides safe time operations that handle errors gracefully.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| {
            warn!("System time is before UNIX epoch, using zero duration");
            Duration::from_secs(0)
        })
}

/// Get current Unix timestamp (seconds since epoch)
///
/// Returns 0 if system time is before epoch (should never happen).
pub fn current_timestamp() -> u64 {
    since_epoch().as_secs()
}

/// Get current Unix timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    since_epoch().as_millis() as u64
}
