//! Timeout monitor for blocking user code
//!
//! Activator callbacks are arbitrary user code that cannot be cancelled. The
//! helper here runs the callback on a dedicated thread and waits for at most
//! the given duration. On expiry the caller gets [`TimedOut`] and moves on;
//! the callback keeps running to completion in the background.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use super::panic_message;

/// The monitored call did not finish in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation timed out after {0:?}")]
pub struct TimedOut(pub Duration);

/// Run `f` on a monitor thread and wait up to `timeout` for it
///
/// Returns `Ok(Ok(value))` on completion, `Ok(Err(message))` if `f` panicked
/// and `Err(TimedOut)` if the deadline passed first.
pub fn call_with_timeout<F, R>(
    label: &str,
    timeout: Duration,
    f: F,
) -> Result<Result<R, String>, TimedOut>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let job = move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(f))
            .map_err(|payload| panic_message(payload.as_ref()));
        let _ = tx.send(outcome);
    };

    let spawned = thread::Builder::new()
        .name(format!("cdmf-{}", label))
        .spawn(job);
    if let Err(e) = spawned {
        return Ok(Err(format!("failed to spawn monitor thread: {}", e)));
    }

    match rx.recv_timeout(timeout) {
        Ok(outcome) => Ok(outcome),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!("{} exceeded {:?}; abandoning wait", label, timeout);
            Err(TimedOut(timeout))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Ok(Err("monitor thread exited without a result".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_in_time() {
        let result = call_with_timeout("quick", Duration::from_secs(1), || 3 + 4);
        assert_eq!(result, Ok(Ok(7)));
    }

    #[test]
    fn test_times_out() {
        let result = call_with_timeout("slow", Duration::from_millis(20), || {
            thread::sleep(Duration::from_millis(300));
        });
        assert_eq!(result, Err(TimedOut(Duration::from_millis(20))));
    }

    #[test]
    fn test_panic_reported() {
        let result: Result<Result<(), String>, TimedOut> =
            call_with_timeout("panicky", Duration::from_secs(1), || panic!("bad start"));
        assert_eq!(result, Ok(Err("bad start".to_string())));
    }
}
