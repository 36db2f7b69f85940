//! # Runtime.
//!
//! [`Runtime`] owns every shared resource: the reactor pool, the two elastic
//! blocking pools, the timer core, the blocked-thread monitor and the event
//! bus. Contexts are created through it and stay valid as cheap handles; the
//! runtime closing tears the whole arrangement down.
//!
//! ```text
//!            ┌────────────────────── Runtime ─────────────────────┐
//!            │ reactor pool   worker pool   internal pool   timers │
//!            │       ▲             ▲              ▲           ▲    │
//!            │       └───────── contexts ─────────┘           │    │
//!            │                     ▲                          │    │
//!            │                 event bus ◄────── reply timeouts    │
//!            └────────────────────────────────────────────────────┘
//! ```
//!
//! ## Rules
//! - `close` is idempotent and drains already-scheduled work where the
//!   underlying pool supports it.
//! - After close, timers are rejected with [`RuntimeError::Closed`]; task
//!   submission to closed pools is dropped silently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::bus::event_bus::EventBus;
use crate::core::config::RuntimeConfig;
use crate::core::context::{Context, ContextKind, ExceptionHandler};
use crate::core::monitor::ThreadMonitor;
use crate::core::reactor::ReactorPool;
use crate::core::timer::TimerCore;
use crate::core::worker::WorkerPool;
use crate::error::RuntimeError;

pub(crate) struct RuntimeCore {
    config: RuntimeConfig,
    monitor: Arc<ThreadMonitor>,
    reactors: ReactorPool,
    worker_pool: Arc<WorkerPool>,
    internal_pool: Arc<WorkerPool>,
    pub(crate) timers: TimerCore,
    /// Cell only breaks the init cycle (the bus needs a weak runtime handle);
    /// always set once construction returns.
    bus: OnceCell<EventBus>,
    default_exception_handler: Arc<Mutex<Option<ExceptionHandler>>>,
    context_seq: AtomicU64,
    closed: AtomicBool,
}

/// Cheaply cloneable handle to one runtime instance.
#[derive(Clone)]
pub struct Runtime {
    core: Arc<RuntimeCore>,
}

impl Runtime {
    /// Builds a runtime with [`RuntimeConfig::default`].
    pub fn new() -> std::io::Result<Runtime> {
        Runtime::with_config(RuntimeConfig::default())
    }

    /// Builds a runtime, spawning its reactor threads and timer runtime.
    pub fn with_config(config: RuntimeConfig) -> std::io::Result<Runtime> {
        let monitor = ThreadMonitor::new(
            config.blocked_thread_check_interval,
            config.warning_exception_time,
        );
        let reactors = ReactorPool::new(
            config.event_loop_pool_size_clamped(),
            &monitor,
            config.max_event_loop_execute_time,
        )?;
        let worker_pool = WorkerPool::new(
            "corebus-worker",
            config.worker_pool_size,
            config.worker_keep_alive,
            config.max_worker_execute_time,
            Arc::clone(&monitor),
        );
        let internal_pool = WorkerPool::new(
            "corebus-internal-blocking",
            config.internal_blocking_pool_size,
            config.worker_keep_alive,
            config.max_worker_execute_time,
            Arc::clone(&monitor),
        );
        let timers = TimerCore::new()?;
        monitor.start(timers.handle());
        let core = Arc::new(RuntimeCore {
            config,
            monitor,
            reactors,
            worker_pool,
            internal_pool,
            timers,
            bus: OnceCell::new(),
            default_exception_handler: Arc::new(Mutex::new(None)),
            context_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let bus = EventBus::new(Arc::downgrade(&core));
        bus.start()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let _ = core.bus.set(bus);
        log::debug!(
            "runtime started: {} reactors, worker pool <= {}",
            core.config.event_loop_pool_size_clamped(),
            core.config.worker_pool_size
        );
        Ok(Runtime { core })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.core.config
    }

    /// Creates a context pinned to the next reactor thread, round robin.
    pub fn event_loop_context(&self) -> Context {
        self.new_context(ContextKind::EventLoop)
    }

    /// Creates an ordered worker context over the blocking pool.
    pub fn worker_context(&self) -> Context {
        self.new_context(ContextKind::Worker)
    }

    /// Creates an unordered worker context; its tasks run in parallel.
    pub fn multi_threaded_worker_context(&self) -> Context {
        self.new_context(ContextKind::MultiThreadedWorker)
    }

    fn new_context(&self, kind: ContextKind) -> Context {
        let id = self.core.context_seq.fetch_add(1, Ordering::Relaxed);
        let reactor = match kind {
            ContextKind::EventLoop => Some(self.core.reactors.next()),
            _ => None,
        };
        Context::new(
            format!("context-{id}"),
            kind,
            reactor,
            Arc::clone(&self.core.worker_pool),
            Arc::clone(&self.core.internal_pool),
            Arc::clone(&self.core.default_exception_handler),
        )
    }

    /// The runtime's event bus.
    pub fn event_bus(&self) -> EventBus {
        // Infallible: the cell is filled before `with_config` returns.
        self.core
            .bus
            .get()
            .cloned()
            .expect("event bus is initialized at construction")
    }

    /// Schedules a one-shot timer firing `handler(id)` on `ctx`.
    pub fn set_timer(
        &self,
        delay: Duration,
        ctx: &Context,
        handler: impl FnOnce(u64) + Send + 'static,
    ) -> Result<u64, RuntimeError> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::Closed);
        }
        self.core.timers.set_timer(delay, ctx.clone(), handler)
    }

    /// Schedules a periodic timer firing `handler(id)` on `ctx` every
    /// `period`.
    pub fn set_periodic(
        &self,
        period: Duration,
        ctx: &Context,
        handler: impl Fn(u64) + Send + Sync + 'static,
    ) -> Result<u64, RuntimeError> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::Closed);
        }
        self.core.timers.set_periodic(period, ctx.clone(), handler)
    }

    /// Cancels a timer. Returns `false` for unknown or already-fired ids.
    pub fn cancel_timer(&self, id: u64) -> bool {
        self.core.timers.cancel(id)
    }

    /// Installs the runtime-wide fallback for panics escaping context tasks.
    pub fn set_exception_handler(
        &self,
        handler: impl Fn(&(dyn std::any::Any + Send)) + Send + Sync + 'static,
    ) {
        *self.core.default_exception_handler.lock() = Some(Arc::new(handler));
    }

    /// Closes the bus, timers, monitor and all thread pools. Idempotent.
    pub fn close(&self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.core.bus.get() {
            bus.close();
        }
        self.core.timers.close();
        self.core.monitor.close();
        self.core.reactors.close();
        self.core.worker_pool.shutdown();
        self.core.internal_pool.shutdown();
        log::debug!("runtime closed");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("closed", &self.core.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn small_runtime() -> Runtime {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut cfg = RuntimeConfig::default();
        cfg.event_loop_pool_size = 2;
        cfg.worker_pool_size = 4;
        cfg.internal_blocking_pool_size = 2;
        Runtime::with_config(cfg).unwrap()
    }

    #[test]
    fn test_context_kinds() {
        let rt = small_runtime();
        assert!(rt.event_loop_context().is_event_loop());
        assert!(rt.worker_context().is_worker());
        assert!(rt
            .multi_threaded_worker_context()
            .is_multi_threaded_worker());
        rt.close();
    }

    #[test]
    fn test_timer_fires_and_cancel_works() {
        let rt = small_runtime();
        let ctx = rt.event_loop_context();
        let (tx, rx) = mpsc::channel();
        let id = rt
            .set_timer(Duration::from_millis(10), &ctx, move |id| {
                tx.send(id).unwrap();
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), id);

        let (tx, rx) = mpsc::channel::<u64>();
        let id = rt
            .set_timer(Duration::from_millis(200), &ctx, move |id| {
                tx.send(id).unwrap();
            })
            .unwrap();
        assert!(rt.cancel_timer(id));
        assert!(!rt.cancel_timer(id));
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
        rt.close();
    }

    #[test]
    fn test_periodic_timer_through_the_runtime() {
        let rt = small_runtime();
        let ctx = rt.worker_context();
        let (tx, rx) = mpsc::channel();
        let id = rt
            .set_periodic(Duration::from_millis(10), &ctx, move |_| {
                let _ = tx.send(());
            })
            .unwrap();
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(rt.cancel_timer(id));
        rt.close();
    }

    #[test]
    fn test_runtime_wide_exception_handler() {
        let rt = small_runtime();
        let (tx, rx) = mpsc::channel::<String>();
        let tx = Mutex::new(tx);
        rt.set_exception_handler(move |payload| {
            let _ = tx.lock().send(crate::error::panic_message(payload).to_string());
        });
        rt.event_loop_context().run_on_context(|| panic!("escaped"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "escaped");
        rt.close();
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_new_timers() {
        let rt = small_runtime();
        let ctx = rt.event_loop_context();
        rt.close();
        rt.close();
        assert!(matches!(
            rt.set_timer(Duration::from_millis(10), &ctx, |_| {}),
            Err(RuntimeError::Closed)
        ));
        assert!(matches!(
            rt.set_periodic(Duration::from_millis(10), &ctx, |_| {}),
            Err(RuntimeError::Closed)
        ));
    }
}
