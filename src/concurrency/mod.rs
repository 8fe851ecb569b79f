//! Concurrency primitives
//!
//! The blocking queue and the worker pool built on it. Event delivery and
//! deferred lifecycle operations are offloaded to the pool.

pub mod pool;
pub mod queue;

pub use pool::{TaskError, TaskHandle, WorkerPool};
pub use queue::BlockingQueue;

use thiserror::Error;

/// Returned when pushing to (or submitting on) a closed queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue is closed")]
pub struct Closed;
