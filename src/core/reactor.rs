//! # Fixed pool of reactor (event loop) threads.
//!
//! Each [`Reactor`] is one dedicated OS thread draining an unbounded task
//! channel in FIFO order. An event-loop context is pinned to exactly one
//! reactor, which is what makes `run_on_context` ordering on such a context a
//! property of the channel rather than of any extra queueing.
//!
//! ## Rules
//! - Submission never blocks and never runs the task inline.
//! - Tasks submitted after close are dropped silently (the runtime is
//!   shutting down; there is nowhere to run them).
//! - A panicking task is caught and logged; the reactor thread survives.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::monitor::ThreadMonitor;
use crate::core::task_queue::{Task, TaskExecutor};
use crate::error::panic_message;

/// One event-loop thread.
pub(crate) struct Reactor {
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    fn spawn(
        name: String,
        monitor: &ThreadMonitor,
        max_exec_time: std::time::Duration,
    ) -> std::io::Result<Reactor> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let state = monitor.register(name.clone(), max_exec_time);
        let join = std::thread::Builder::new().name(name).spawn(move || {
            while let Some(task) = rx.blocking_recv() {
                state.execute_start();
                if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                    log::error!(
                        "reactor {} caught unexpected panic: {}",
                        state.name(),
                        panic_message(payload.as_ref())
                    );
                }
                state.execute_end();
            }
        })?;
        Ok(Reactor {
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
        })
    }

    fn shutdown(&self) {
        // Dropping the sender ends the drain loop after pending tasks ran.
        self.tx.lock().take();
        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

impl TaskExecutor for Reactor {
    fn execute(&self, task: Task) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(task);
        }
    }
}

/// Fixed-size pool of reactors with round-robin assignment.
pub(crate) struct ReactorPool {
    reactors: Vec<Arc<Reactor>>,
    next: AtomicUsize,
}

impl ReactorPool {
    pub(crate) fn new(
        size: usize,
        monitor: &ThreadMonitor,
        max_exec_time: std::time::Duration,
    ) -> std::io::Result<ReactorPool> {
        let mut reactors = Vec::with_capacity(size);
        for i in 0..size {
            reactors.push(Arc::new(Reactor::spawn(
                format!("corebus-eventloop-{i}"),
                monitor,
                max_exec_time,
            )?));
        }
        Ok(ReactorPool {
            reactors,
            next: AtomicUsize::new(0),
        })
    }

    /// Picks the next reactor, round robin.
    pub(crate) fn next(&self) -> Arc<Reactor> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        Arc::clone(&self.reactors[i])
    }

    /// Drains and joins every reactor thread. Idempotent.
    pub(crate) fn close(&self) {
        for reactor in &self.reactors {
            reactor.shutdown();
        }
    }
}
