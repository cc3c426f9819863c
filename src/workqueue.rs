//! A small cross-thread work queue: the interrupt path appends closures
//! describing what needs parsing off a completion ring, and a single
//! worker thread drains and runs them serially.
//!
//! Keeping the interrupt path to "parse what's available, enqueue a
//! closure, return" means the interrupt handler never blocks on ioctl
//! completion, flow-ring bookkeeping, or anything else the worker alone
//! owns.

use std::sync::{Condvar, Mutex};

type WorkItem = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    items: Vec<WorkItem>,
    shutdown: bool,
}

/// A FIFO queue of `FnOnce` closures, handed off between an interrupt
/// producer and a single worker consumer.
pub struct WorkQueue {
    state: Mutex<State>,
    condvar: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            condvar: Condvar::new(),
        }
    }

    /// Appends a work item and wakes the worker thread.
    pub fn push(&self, item: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        state.items.push(Box::new(item));
        self.condvar.notify_one();
    }

    /// Blocks until at least one item is queued or the queue is shut
    /// down, then returns the entire batch (in FIFO order), leaving the
    /// queue empty. Returns an empty `Vec` only when shutting down.
    pub fn wait_for_batch(&self) -> Vec<WorkItem> {
        let mut state = self.state.lock().unwrap();
        while state.items.is_empty() && !state.shutdown {
            state = self.condvar.wait(state).unwrap();
        }
        std::mem::take(&mut state.items)
    }

    /// Wakes the worker thread with an empty batch so it can observe
    /// `is_shutdown` and exit.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        self.condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}
