//! # Elastic blocking-worker pool.
//!
//! [`WorkerPool`] runs blocking tasks on plain OS threads, growing on demand
//! up to a configured maximum and retiring threads that sit idle past the
//! keep-alive. The runtime owns two of these: one for user `execute_blocking`
//! work and an internal one so runtime housekeeping never queues behind user
//! blocking calls.
//!
//! ## Rules
//! - A new thread is spawned only when a task arrives, nobody is idle and the
//!   pool is below its maximum; otherwise one idle thread is woken.
//! - Threads waiting longer than the keep-alive with an empty queue retire.
//! - Shutdown drains already-queued tasks before the threads exit; tasks
//!   submitted after shutdown are dropped silently.
//! - A panicking task is caught and logged; the worker thread survives.
//!
//! Ordering across tasks is NOT a pool property. Callers that need ordering
//! route submissions through a [`TaskQueue`](crate::core::task_queue::TaskQueue)
//! with the pool as the executor.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::core::monitor::{ThreadMonitor, ThreadState};
use crate::core::task_queue::{Task, TaskExecutor};
use crate::error::panic_message;

struct PoolState {
    queue: VecDeque<Task>,
    /// Threads currently alive (working or idle).
    total: usize,
    /// Threads parked on the condvar.
    idle: usize,
    shutdown: bool,
    joins: Vec<JoinHandle<()>>,
}

/// Grow-on-demand pool of blocking worker threads.
pub(crate) struct WorkerPool {
    name: String,
    max_threads: usize,
    keep_alive: Duration,
    max_exec_time: Duration,
    monitor: Arc<ThreadMonitor>,
    state: Mutex<PoolState>,
    condvar: Condvar,
    next_thread_id: AtomicUsize,
    weak: Weak<WorkerPool>,
}

impl WorkerPool {
    pub(crate) fn new(
        name: impl Into<String>,
        max_threads: usize,
        keep_alive: Duration,
        max_exec_time: Duration,
        monitor: Arc<ThreadMonitor>,
    ) -> Arc<WorkerPool> {
        Arc::new_cyclic(|weak| WorkerPool {
            name: name.into(),
            max_threads: max_threads.max(1),
            keep_alive,
            max_exec_time,
            monitor,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                total: 0,
                idle: 0,
                shutdown: false,
                joins: Vec::new(),
            }),
            condvar: Condvar::new(),
            next_thread_id: AtomicUsize::new(0),
            weak: weak.clone(),
        })
    }

    fn spawn_worker(&self) {
        let pool = match self.weak.upgrade() {
            Some(pool) => pool,
            None => return,
        };
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{id}", self.name);
        let state = self.monitor.register(name.clone(), self.max_exec_time);
        match std::thread::Builder::new()
            .name(name)
            .spawn(move || pool.worker_loop(state))
        {
            Ok(join) => {
                let mut state = self.state.lock();
                // Retired threads leave their handle behind; reap them here so
                // the vector stays bounded under thread churn.
                state.joins.retain(|j| !j.is_finished());
                state.joins.push(join);
            }
            Err(err) => {
                log::error!("failed to spawn thread in pool {}: {err}", self.name);
                self.state.lock().total -= 1;
            }
        }
    }

    fn worker_loop(self: Arc<Self>, thread_state: Arc<ThreadState>) {
        loop {
            let task = {
                let mut state = self.state.lock();
                loop {
                    if let Some(task) = state.queue.pop_front() {
                        break Some(task);
                    }
                    if state.shutdown {
                        state.total -= 1;
                        break None;
                    }
                    state.idle += 1;
                    let timed_out = self.condvar.wait_for(&mut state, self.keep_alive);
                    state.idle -= 1;
                    if timed_out.timed_out() && state.queue.is_empty() && !state.shutdown {
                        // Idle past the keep-alive: retire. The count must drop
                        // under the same lock `execute` reads it with, or a
                        // submission in between would see this thread as alive
                        // and neither spawn nor wake anyone.
                        state.total -= 1;
                        break None;
                    }
                }
            };
            match task {
                Some(task) => {
                    thread_state.execute_start();
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                        log::error!(
                            "worker {} caught unexpected panic: {}",
                            thread_state.name(),
                            panic_message(payload.as_ref())
                        );
                    }
                    thread_state.execute_end();
                }
                None => return,
            }
        }
    }

    /// Stops the pool after draining already-queued tasks. Idempotent.
    pub(crate) fn shutdown(&self) {
        let joins = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            std::mem::take(&mut state.joins)
        };
        self.condvar.notify_all();
        for join in joins {
            let _ = join.join();
        }
    }

    #[cfg(test)]
    pub(crate) fn thread_count(&self) -> usize {
        self.state.lock().total
    }

    #[cfg(test)]
    pub(crate) fn join_count(&self) -> usize {
        self.state.lock().joins.len()
    }
}

impl TaskExecutor for WorkerPool {
    fn execute(&self, task: Task) {
        let spawn = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.queue.push_back(task);
            if state.idle > 0 {
                self.condvar.notify_one();
                false
            } else if state.total < self.max_threads {
                state.total += 1;
                true
            } else {
                // Saturated: some busy worker will pick the task up.
                false
            }
        };
        if spawn {
            self.spawn_worker();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn pool(max: usize, keep_alive: Duration) -> Arc<WorkerPool> {
        let monitor = ThreadMonitor::new(Duration::from_secs(1), Duration::from_secs(5));
        WorkerPool::new("test-worker", max, keep_alive, Duration::from_secs(60), monitor)
    }

    #[test]
    fn test_runs_submitted_tasks() {
        let pool = pool(4, Duration::from_secs(10));
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            pool.execute(Box::new(move || {
                tx.send(i).unwrap();
            }));
        }
        let mut seen: Vec<i32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn test_grows_to_run_blocking_tasks_concurrently() {
        let pool = pool(2, Duration::from_secs(10));
        let (tx, rx) = mpsc::channel();
        let gate = Arc::new(std::sync::Barrier::new(2));
        for _ in 0..2 {
            let tx = tx.clone();
            let gate = Arc::clone(&gate);
            pool.execute(Box::new(move || {
                // Both tasks must be running at once to pass the barrier.
                gate.wait();
                tx.send(()).unwrap();
            }));
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_never_exceeds_max_threads() {
        let pool = pool(2, Duration::from_secs(10));
        let (tx, rx) = mpsc::channel();
        for _ in 0..10 {
            let tx = tx.clone();
            pool.execute(Box::new(move || {
                std::thread::sleep(Duration::from_millis(10));
                tx.send(()).unwrap();
            }));
        }
        assert!(pool.thread_count() <= 2);
        for _ in 0..10 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        pool.shutdown();
    }

    #[test]
    fn test_idle_threads_retire_after_keep_alive() {
        let pool = pool(4, Duration::from_millis(50));
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || {
            tx.send(()).unwrap();
        }));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        for _ in 0..100 {
            if pool.thread_count() == 0 {
                pool.shutdown();
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("idle worker never retired");
    }

    #[test]
    fn test_shutdown_drains_queued_tasks() {
        let pool = pool(1, Duration::from_secs(10));
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            pool.execute(Box::new(move || {
                std::thread::sleep(Duration::from_millis(5));
                tx.send(i).unwrap();
            }));
        }
        pool.shutdown();
        let seen: Vec<i32> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..5).collect::<Vec<_>>());
    }

    #[test]
    fn test_no_task_is_stranded_by_a_retiring_worker() {
        // Submissions timed around keep-alive expiry on a single-thread pool.
        // A retirement not visible to `execute` would leave a task queued with
        // no thread to run it.
        let pool = pool(1, Duration::from_millis(1));
        let (tx, rx) = mpsc::channel();
        for i in 0..200 {
            let tx = tx.clone();
            pool.execute(Box::new(move || {
                tx.send(i).unwrap();
            }));
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), i);
            std::thread::sleep(Duration::from_millis(1));
        }
        pool.shutdown();
    }

    #[test]
    fn test_retired_join_handles_are_reaped() {
        let pool = pool(1, Duration::from_millis(10));
        for _ in 0..5 {
            let (tx, rx) = mpsc::channel();
            pool.execute(Box::new(move || {
                tx.send(()).unwrap();
            }));
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
            for _ in 0..100 {
                if pool.thread_count() == 0 {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            assert_eq!(pool.thread_count(), 0);
            // Give the retired thread a moment to fully exit.
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(pool.join_count() <= 2, "joins kept: {}", pool.join_count());
        pool.shutdown();
    }

    #[test]
    fn test_panicking_task_does_not_kill_the_worker() {
        let pool = pool(1, Duration::from_secs(10));
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(|| panic!("boom")));
        pool.execute(Box::new(move || {
            tx.send(()).unwrap();
        }));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown();
    }
}
