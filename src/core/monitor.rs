//! # Blocked-thread monitor.
//!
//! Every pool thread (reactor or blocking worker) owns a [`ThreadState`] and
//! brackets each task with [`ThreadState::execute_start`] /
//! [`ThreadState::execute_end`]. A single shared scan, driven off the timer
//! runtime, walks all live states and warns about any thread whose current
//! task has outlived its allowed execution time.
//!
//! ## Rules
//! - Purely observational: no thread is ever interrupted or killed.
//! - States are held weakly; a retired pool thread drops out of the scan
//!   without explicit deregistration.
//! - Overruns past the per-thread limit log at warn level; overruns that also
//!   exceed the configured `warning_exception_time` escalate to error level.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Per-thread execution bookkeeping read by the monitor.
pub(crate) struct ThreadState {
    name: String,
    max_exec_time: Duration,
    epoch: Instant,
    /// Nanoseconds since `epoch` at which the current task started;
    /// 0 while the thread is idle.
    start: AtomicU64,
}

impl ThreadState {
    /// Marks the thread as entering a unit of work.
    pub(crate) fn execute_start(&self) {
        let nanos = (self.epoch.elapsed().as_nanos() as u64).max(1);
        self.start.store(nanos, Ordering::Relaxed);
    }

    /// Marks the thread as idle again.
    pub(crate) fn execute_end(&self) {
        self.start.store(0, Ordering::Relaxed);
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

/// One overrun observed by a scan.
#[derive(Debug)]
pub(crate) struct BlockedThread {
    pub(crate) name: String,
    pub(crate) blocked_for: Duration,
    pub(crate) limit: Duration,
}

/// Periodic scanner over all live [`ThreadState`]s.
pub(crate) struct ThreadMonitor {
    epoch: Instant,
    interval: Duration,
    warning_exception_time: Duration,
    threads: Mutex<Vec<Weak<ThreadState>>>,
    token: CancellationToken,
}

impl ThreadMonitor {
    pub(crate) fn new(interval: Duration, warning_exception_time: Duration) -> Arc<ThreadMonitor> {
        Arc::new(ThreadMonitor {
            epoch: Instant::now(),
            interval,
            warning_exception_time,
            threads: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
        })
    }

    /// Registers a new execution thread and returns its state handle.
    ///
    /// The monitor keeps only a weak reference; the pool thread owns the
    /// state and drops it when it retires.
    pub(crate) fn register(&self, name: impl Into<String>, max_exec_time: Duration) -> Arc<ThreadState> {
        let state = Arc::new(ThreadState {
            name: name.into(),
            max_exec_time,
            epoch: self.epoch,
            start: AtomicU64::new(0),
        });
        self.threads.lock().push(Arc::downgrade(&state));
        state
    }

    /// Spawns the periodic scan on the timer runtime.
    pub(crate) fn start(self: &Arc<Self>, handle: &tokio::runtime::Handle) {
        let monitor = Arc::clone(self);
        let token = self.token.clone();
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => monitor.report(monitor.scan()),
                }
            }
        });
    }

    /// Walks all live thread states and collects overruns.
    ///
    /// Dead weak references are compacted out as a side effect.
    pub(crate) fn scan(&self) -> Vec<BlockedThread> {
        let now = self.epoch.elapsed().as_nanos() as u64;
        let mut offenders = Vec::new();
        let mut threads = self.threads.lock();
        threads.retain(|weak| match weak.upgrade() {
            None => false,
            Some(state) => {
                let start = state.start.load(Ordering::Relaxed);
                if start != 0 {
                    let blocked_for = Duration::from_nanos(now.saturating_sub(start));
                    if blocked_for > state.max_exec_time {
                        offenders.push(BlockedThread {
                            name: state.name.clone(),
                            blocked_for,
                            limit: state.max_exec_time,
                        });
                    }
                }
                true
            }
        });
        offenders
    }

    fn report(&self, offenders: Vec<BlockedThread>) {
        for o in offenders {
            if o.blocked_for <= self.warning_exception_time {
                log::warn!(
                    "thread {} has been blocked for {} ms, time limit is {} ms",
                    o.name,
                    o.blocked_for.as_millis(),
                    o.limit.as_millis()
                );
            } else {
                log::error!(
                    "thread {} has been blocked for {} ms, time limit is {} ms",
                    o.name,
                    o.blocked_for.as_millis(),
                    o.limit.as_millis()
                );
            }
        }
    }

    /// Stops the periodic scan. Idempotent.
    pub(crate) fn close(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_thread_is_never_flagged() {
        let monitor = ThreadMonitor::new(Duration::from_millis(10), Duration::from_secs(5));
        let _state = monitor.register("idle-thread", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(monitor.scan().is_empty());
    }

    #[test]
    fn test_overrunning_task_is_flagged() {
        let monitor = ThreadMonitor::new(Duration::from_millis(10), Duration::from_secs(5));
        let state = monitor.register("busy-thread", Duration::from_millis(5));
        state.execute_start();
        std::thread::sleep(Duration::from_millis(30));
        let offenders = monitor.scan();
        assert_eq!(offenders.len(), 1);
        assert_eq!(offenders[0].name, "busy-thread");
        assert!(offenders[0].blocked_for >= Duration::from_millis(5));

        state.execute_end();
        assert!(monitor.scan().is_empty());
    }

    #[test]
    fn test_dropped_threads_fall_out_of_the_scan() {
        let monitor = ThreadMonitor::new(Duration::from_millis(10), Duration::from_secs(5));
        let state = monitor.register("short-lived", Duration::from_millis(1));
        state.execute_start();
        drop(state);
        assert!(monitor.scan().is_empty());
    }

    #[test]
    fn test_fast_task_within_limit_is_not_flagged() {
        let monitor = ThreadMonitor::new(Duration::from_millis(10), Duration::from_secs(5));
        let state = monitor.register("quick", Duration::from_secs(60));
        state.execute_start();
        assert!(monitor.scan().is_empty());
        state.execute_end();
    }
}
