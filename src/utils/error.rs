//! Error containment helpers
//!
//! Listener callbacks and activators are user code. These helpers keep their
//! failures (errors and panics alike) from escaping into framework state.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::warn;

/// Execute an operation and log errors without failing
///
/// Returns `Some(T)` on success, `None` on error (after logging).
///
/// # Example
/// ```rust
/// use cdmf::utils::log_error;
///
/// let parsed = log_error(|| "12".parse::<u32>(), "Failed to parse");
/// assert_eq!(parsed, Some(12));
/// ```
pub fn log_error<F, T, E>(operation: F, context: &str) -> Option<T>
where
    F: FnOnce() -> Result<T, E>,
    E: std::fmt::Display,
{
    match operation() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{}: {}", context, e);
            None
        }
    }
}

/// Run a callback, catching and logging any panic
///
/// Returns `true` if the callback completed normally.
pub fn contain_panic<F>(operation: F, context: &str) -> bool
where
    F: FnOnce(),
{
    match panic::catch_unwind(AssertUnwindSafe(operation)) {
        Ok(()) => true,
        Err(payload) => {
            warn!("{}: {}", context, panic_message(payload.as_ref()));
            false
        }
    }
}

/// Extract a readable message from a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contain_panic() {
        assert!(contain_panic(|| {}, "noop"));
        assert!(!contain_panic(|| panic!("listener exploded"), "listener"));
    }

    #[test]
    fn test_panic_message_variants() {
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload = panic::catch_unwind(|| panic!("formatted {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 1");
    }

    #[test]
    fn test_log_error() {
        assert_eq!(log_error(|| "x".parse::<u8>(), "parse"), None);
    }
}
