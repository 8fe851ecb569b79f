//! Blocking MPMC queue with close semantics
//!
//! A FIFO guarded by one mutex and two condition variables. Producers block
//! while a bounded queue is full; consumers block while it is empty. Closing
//! wakes everyone: later pushes fail, pops keep draining what is left and
//! return `None` once the queue is both closed and empty.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::Closed;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded or unbounded blocking queue
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
}

impl<T> BlockingQueue<T> {
    /// Create an unbounded queue
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Push an item, blocking while the queue is full
    ///
    /// Fails with [`Closed`] if the queue is closed before or while waiting.
    pub fn push(&self, item: T) -> Result<(), Closed> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Closed);
            }
            if !self.is_full(&state) {
                break;
            }
            self.not_full.wait(&mut state);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push without blocking; returns `false` if full or closed
    pub fn try_push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.closed || self.is_full(&state) {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        true
    }

    /// Pop the oldest item, blocking until one arrives or the queue closes
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Pop with a deadline; `None` on timeout or when closed and drained
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                // An item may have raced in together with the timeout.
                let item = state.items.pop_front();
                if item.is_some() {
                    drop(state);
                    self.not_full.notify_one();
                }
                return item;
            }
        }
    }

    /// Close the queue. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether no items are queued
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Capacity bound, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn is_full(&self, state: &QueueState<T>) -> bool {
        matches!(self.capacity, Some(cap) if state.items.len() >= cap)
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}
