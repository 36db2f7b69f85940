//! # Timer facility.
//!
//! One small dedicated tokio runtime ("corebus-timer") drives every timer in
//! the process, plus the blocked-thread monitor scan. Timer handlers never
//! run on the timer thread: each firing is dispatched to the context the
//! timer was scheduled against.
//!
//! ## Rules
//! - Delays and periods below 1 ms are rejected.
//! - Cancellation is race-free for one-shot timers: either the handler fires
//!   or `cancel` returns `true`, never both.
//! - A periodic timer keeps firing until cancelled or the runtime closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::context::Context;
use crate::error::RuntimeError;

const MIN_DELAY: Duration = Duration::from_millis(1);

/// Shared timer wheel backed by a one-thread tokio runtime.
pub(crate) struct TimerCore {
    rt: Mutex<Option<tokio::runtime::Runtime>>,
    handle: tokio::runtime::Handle,
    timers: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    counter: AtomicU64,
    root: CancellationToken,
    closed: AtomicBool,
}

impl TimerCore {
    pub(crate) fn new() -> std::io::Result<TimerCore> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("corebus-timer")
            .enable_time()
            .build()?;
        let handle = rt.handle().clone();
        Ok(TimerCore {
            rt: Mutex::new(Some(rt)),
            handle,
            timers: Arc::new(Mutex::new(HashMap::new())),
            counter: AtomicU64::new(0),
            root: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Handle to the timer runtime, for auxiliary periodic jobs.
    pub(crate) fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }

    /// Schedules a one-shot timer firing on `ctx` after `delay`.
    pub(crate) fn set_timer(
        &self,
        delay: Duration,
        ctx: Context,
        handler: impl FnOnce(u64) + Send + 'static,
    ) -> Result<u64, RuntimeError> {
        let (id, token) = self.arm(delay)?;
        let timers = Arc::clone(&self.timers);
        self.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // Removal is the commit point against concurrent cancel.
                    if timers.lock().remove(&id).is_some() {
                        ctx.run_on_context(move || handler(id));
                    }
                }
            }
        });
        Ok(id)
    }

    /// Schedules a periodic timer firing on `ctx` every `period`, first
    /// firing one period from now.
    pub(crate) fn set_periodic(
        &self,
        period: Duration,
        ctx: Context,
        handler: impl Fn(u64) + Send + Sync + 'static,
    ) -> Result<u64, RuntimeError> {
        let (id, token) = self.arm(period)?;
        let timers = Arc::clone(&self.timers);
        let handler = Arc::new(handler);
        self.handle.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !timers.lock().contains_key(&id) {
                            break;
                        }
                        let handler = Arc::clone(&handler);
                        ctx.run_on_context(move || handler(id));
                    }
                }
            }
        });
        Ok(id)
    }

    fn arm(&self, delay: Duration) -> Result<(u64, CancellationToken), RuntimeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::Closed);
        }
        if delay < MIN_DELAY {
            return Err(RuntimeError::InvalidTimerDelay { delay });
        }
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let token = self.root.child_token();
        self.timers.lock().insert(id, token.clone());
        Ok((id, token))
    }

    /// Cancels a timer. Returns `false` when the id is unknown or the timer
    /// already fired (one-shot) or was cancelled.
    pub(crate) fn cancel(&self, id: u64) -> bool {
        match self.timers.lock().remove(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels all timers and shuts the timer runtime down. Idempotent.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.root.cancel();
        self.timers.lock().clear();
        if let Some(rt) = self.rt.lock().take() {
            rt.shutdown_background();
        }
    }
}
