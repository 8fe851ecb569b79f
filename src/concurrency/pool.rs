//! Fixed-size worker pool
//!
//! N named threads loop on a [`BlockingQueue`] of boxed jobs. `submit` wraps
//! the callable so that its result, or the panic it raised, lands in the
//! returned [`TaskHandle`]. A panicking task never takes its worker down.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::{BlockingQueue, Closed};
use crate::utils::panic_message;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Failure of a submitted task
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task was dropped before it ran")]
    Cancelled,
}

/// Result slot of a submitted task
///
/// Either block on it with [`TaskHandle::wait`] or `.await` it from async code.
#[must_use = "dropping a TaskHandle discards the task's result"]
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<Result<R, TaskError>>,
}

impl<R> TaskHandle<R> {
    /// Block the current thread until the task finishes
    ///
    /// Must not be called from within an async runtime; `.await` the handle there.
    pub fn wait(self) -> Result<R, TaskError> {
        self.rx.blocking_recv().unwrap_or(Err(TaskError::Cancelled))
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskError::Cancelled)))
    }
}

/// Worker pool
pub struct WorkerPool {
    queue: Arc<BlockingQueue<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

impl WorkerPool {
    /// Create a pool with `threads` workers and an unbounded queue
    pub fn new(threads: usize) -> Self {
        Self::with_capacity(threads, None)
    }

    /// Create a pool whose queue holds at most `capacity` pending jobs
    pub fn with_capacity(threads: usize, capacity: Option<usize>) -> Self {
        let threads = threads.max(1);
        let queue = Arc::new(match capacity {
            Some(cap) => BlockingQueue::bounded(cap),
            None => BlockingQueue::unbounded(),
        });

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let queue = Arc::clone(&queue);
            let spawned = thread::Builder::new()
                .name(format!("cdmf-worker-{}", index))
                .spawn(move || worker_loop(index, queue));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => error!("Failed to spawn worker {}: {}", index, e),
            }
        }
        debug!("Worker pool started with {} threads", workers.len());

        Self {
            queue,
            workers: Mutex::new(workers),
            threads,
        }
    }

    /// Queue a callable and get a handle to its result
    pub fn submit<F, R>(&self, f: F) -> Result<TaskHandle<R>, Closed>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f))
                .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));
            // The submitter may have dropped its handle; that is fine.
            let _ = tx.send(outcome);
        });
        self.queue.push(job)?;
        Ok(TaskHandle { rx })
    }

    /// Queue a callable whose result nobody waits for
    pub fn execute<F>(&self, f: F) -> Result<(), Closed>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.push(Box::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                warn!("Detached task panicked: {}", panic_message(payload.as_ref()));
            }
        }))
    }

    /// Stop accepting work; queued jobs still run
    pub fn shutdown(&self) {
        self.queue.close();
    }

    /// Join every worker. Call after [`WorkerPool::shutdown`].
    pub fn wait(&self) {
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            // A job that drops the last reference to its own pool must not join itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Worker thread terminated abnormally");
            }
        }
    }

    /// Configured number of workers
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Jobs queued but not yet picked up
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether `shutdown` has been called
    pub fn is_shutdown(&self) -> bool {
        self.queue.is_closed()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        self.wait();
    }
}

fn worker_loop(index: usize, queue: Arc<BlockingQueue<Job>>) {
    while let Some(job) = queue.pop() {
        job();
    }
    debug!("Worker {} exiting", index);
}
