//! # Ordered task queue preserving FIFO order across executor handoffs.
//!
//! [`TaskQueue`] serializes a sequence of tasks even when consecutive tasks
//! target different executors (for example a context interleaving ordered
//! blocking work with regular context tasks). It is the primitive behind the
//! "successive ordered submissions run in submission order" guarantee.
//!
//! ## State machine
//! ```text
//!            execute(task, exec)
//!   ┌─────┐ ──────────────────────► ┌────────────────────┐
//!   │idle │                         │ draining(current)  │◄─┐
//!   └─────┘ ◄────────────────────── └────────────────────┘  │
//!            queue empties            │ head targets other  │
//!                                     │ executor: re-push   │
//!                                     │ head, resubmit loop │
//!                                     └─────────────────────┘
//! ```
//!
//! ## Rules
//! - At most one executor drives the queue at any instant.
//! - The drain loop never straddles two executors: when the head targets a
//!   different executor, the head is pushed back to the front and the loop is
//!   resubmitted there.
//! - A panicking task is caught and logged; the drain continues.
//! - Tasks run outside the queue lock.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::panic_message;

/// A unit of work scheduled onto an executor.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run a [`Task`] asynchronously.
///
/// Implemented by the reactor threads and the elastic blocking pools.
/// Executor identity (via `Arc` pointer equality) decides when the queue has
/// to hop.
pub(crate) trait TaskExecutor: Send + Sync {
    /// Submits a task for asynchronous execution. Never runs it inline.
    fn execute(&self, task: Task);
}

struct QueuedTask {
    task: Task,
    exec: Arc<dyn TaskExecutor>,
}

#[derive(Default)]
struct Inner {
    tasks: VecDeque<QueuedTask>,
    /// Executor currently draining the queue; `None` means idle.
    current: Option<Arc<dyn TaskExecutor>>,
}

/// FIFO serializer for tasks that may target different executors.
pub(crate) struct TaskQueue {
    inner: Mutex<Inner>,
}

impl TaskQueue {
    pub(crate) fn new() -> Arc<TaskQueue> {
        Arc::new(TaskQueue {
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Appends `task` and starts draining on `exec` if the queue was idle.
    pub(crate) fn execute(self: &Arc<Self>, task: Task, exec: Arc<dyn TaskExecutor>) {
        let submit_to = {
            let mut inner = self.inner.lock();
            inner.tasks.push_back(QueuedTask {
                task,
                exec: Arc::clone(&exec),
            });
            if inner.current.is_none() {
                inner.current = Some(Arc::clone(&exec));
                Some(exec)
            } else {
                None
            }
        };
        if let Some(exec) = submit_to {
            let queue = Arc::clone(self);
            exec.execute(Box::new(move || queue.run()));
        }
    }

    /// Drain loop, always entered on the executor recorded in `current`.
    fn run(self: Arc<Self>) {
        loop {
            let task = {
                let mut inner = self.inner.lock();
                match inner.tasks.pop_front() {
                    None => {
                        inner.current = None;
                        return;
                    }
                    Some(head) => {
                        let driving = inner
                            .current
                            .as_ref()
                            .map(Arc::clone)
                            .unwrap_or_else(|| Arc::clone(&head.exec));
                        if !Arc::ptr_eq(&head.exec, &driving) {
                            // The head belongs to another executor: hand the
                            // whole drain over without running anything here.
                            let next = Arc::clone(&head.exec);
                            inner.current = Some(Arc::clone(&next));
                            inner.tasks.push_front(head);
                            drop(inner);
                            let queue = Arc::clone(&self);
                            next.execute(Box::new(move || queue.run()));
                            return;
                        }
                        head.task
                    }
                }
            };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                log::error!(
                    "task queue caught unexpected panic: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.current.is_none() && inner.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Executor backed by a dedicated thread draining a channel.
    struct ThreadExecutor {
        tx: mpsc::Sender<Task>,
    }

    impl ThreadExecutor {
        fn spawn() -> Arc<ThreadExecutor> {
            let (tx, rx) = mpsc::channel::<Task>();
            std::thread::spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            });
            Arc::new(ThreadExecutor { tx })
        }
    }

    impl TaskExecutor for ThreadExecutor {
        fn execute(&self, task: Task) {
            let _ = self.tx.send(task);
        }
    }

    #[test]
    fn test_single_executor_preserves_submission_order() {
        let exec: Arc<dyn TaskExecutor> = ThreadExecutor::spawn();
        let queue = TaskQueue::new();
        let (tx, rx) = mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            queue.execute(
                Box::new(move || {
                    tx.send(i).unwrap();
                }),
                Arc::clone(&exec),
            );
        }
        let seen: Vec<i32> = (0..100)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_order_survives_executor_hops() {
        let a: Arc<dyn TaskExecutor> = ThreadExecutor::spawn();
        let b: Arc<dyn TaskExecutor> = ThreadExecutor::spawn();
        let queue = TaskQueue::new();
        let (tx, rx) = mpsc::channel();
        for i in 0..50 {
            let tx = tx.clone();
            let exec = if i % 3 == 0 {
                Arc::clone(&a)
            } else {
                Arc::clone(&b)
            };
            queue.execute(
                Box::new(move || {
                    tx.send(i).unwrap();
                }),
                exec,
            );
        }
        let seen: Vec<i32> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_task_does_not_stall_the_queue() {
        let exec: Arc<dyn TaskExecutor> = ThreadExecutor::spawn();
        let queue = TaskQueue::new();
        let (tx, rx) = mpsc::channel();
        queue.execute(Box::new(|| panic!("boom")), Arc::clone(&exec));
        queue.execute(
            Box::new(move || {
                tx.send("after").unwrap();
            }),
            Arc::clone(&exec),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "after");
    }

    #[test]
    fn test_queue_returns_to_idle_when_empty() {
        let exec: Arc<dyn TaskExecutor> = ThreadExecutor::spawn();
        let queue = TaskQueue::new();
        let (tx, rx) = mpsc::channel();
        queue.execute(
            Box::new(move || {
                tx.send(()).unwrap();
            }),
            Arc::clone(&exec),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // The drain loop clears `current` right after the last task.
        for _ in 0..100 {
            if queue.is_idle() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("queue never returned to idle");
    }
}
