//! # Global runtime configuration.
//!
//! Provides [`RuntimeConfig`], the centralized settings for a [`Runtime`](crate::Runtime):
//! pool sizes, per-thread execution-time caps and the blocked-thread monitor
//! cadence.
//!
//! ## Field semantics
//! - `event_loop_pool_size`: fixed number of reactor threads
//! - `worker_pool_size` / `internal_blocking_pool_size`: upper bounds of the
//!   two elastic blocking pools (threads are spawned on demand and retired
//!   when idle)
//! - `max_event_loop_execute_time` / `max_worker_execute_time`: per-task
//!   duration after which the monitor starts warning
//! - `blocked_thread_check_interval`: monitor scan cadence
//! - `warning_exception_time`: second, larger threshold that escalates the
//!   warning severity

use std::time::Duration;

/// Global configuration for the runtime.
///
/// All fields are public for flexibility; [`RuntimeConfig::default`] matches
/// the sizing a general-purpose embedder wants.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Number of reactor (event loop) threads. Fixed for the runtime's lifetime.
    pub event_loop_pool_size: usize,

    /// Maximum number of threads in the blocking worker pool.
    pub worker_pool_size: usize,

    /// Maximum number of threads in the internal blocking pool.
    ///
    /// Runtime-internal blocking work runs here so it never queues behind
    /// user `execute_blocking` submissions.
    pub internal_blocking_pool_size: usize,

    /// How long an idle blocking-pool thread lingers before retiring.
    pub worker_keep_alive: Duration,

    /// Maximum time a single task may occupy a reactor thread before the
    /// monitor warns.
    pub max_event_loop_execute_time: Duration,

    /// Maximum time a single task may occupy a worker thread before the
    /// monitor warns.
    pub max_worker_execute_time: Duration,

    /// Interval between blocked-thread monitor scans.
    pub blocked_thread_check_interval: Duration,

    /// Overrun beyond which a blocked-thread warning escalates to error
    /// severity.
    pub warning_exception_time: Duration,
}

impl RuntimeConfig {
    /// Number of reactor threads clamped to a minimum of 1.
    #[inline]
    pub fn event_loop_pool_size_clamped(&self) -> usize {
        self.event_loop_pool_size.max(1)
    }
}

impl Default for RuntimeConfig {
    /// Default configuration:
    ///
    /// - `event_loop_pool_size = 2 × available CPUs`
    /// - `worker_pool_size = 20`, `internal_blocking_pool_size = 20`
    /// - `worker_keep_alive = 10s`
    /// - `max_event_loop_execute_time = 2s`, `max_worker_execute_time = 60s`
    /// - `blocked_thread_check_interval = 1s`, `warning_exception_time = 5s`
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            event_loop_pool_size: 2 * cpus,
            worker_pool_size: 20,
            internal_blocking_pool_size: 20,
            worker_keep_alive: Duration::from_secs(10),
            max_event_loop_execute_time: Duration::from_secs(2),
            max_worker_execute_time: Duration::from_secs(60),
            blocked_thread_check_interval: Duration::from_secs(1),
            warning_exception_time: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_sizing() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.worker_pool_size, 20);
        assert_eq!(cfg.internal_blocking_pool_size, 20);
        assert_eq!(cfg.max_event_loop_execute_time, Duration::from_secs(2));
        assert_eq!(cfg.max_worker_execute_time, Duration::from_secs(60));
        assert_eq!(cfg.blocked_thread_check_interval, Duration::from_secs(1));
        assert!(cfg.event_loop_pool_size >= 2);
    }

    #[test]
    fn test_event_loop_pool_size_clamped() {
        let mut cfg = RuntimeConfig::default();
        cfg.event_loop_pool_size = 0;
        assert_eq!(cfg.event_loop_pool_size_clamped(), 1);
    }
}
