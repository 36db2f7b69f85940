//! # Execution contexts.
//!
//! A [`Context`] is a handle onto one of the runtime's execution disciplines.
//! All scheduling in the crate goes through an explicit context handle; there
//! is no ambient "current context" lookup.
//!
//! ```text
//!   ContextKind::EventLoop ──────────► pinned reactor thread (strict FIFO)
//!   ContextKind::Worker ─────────────► ordered task queue over the worker pool
//!   ContextKind::MultiThreadedWorker ► worker pool directly (no ordering)
//! ```
//!
//! ## Rules
//! - `run_on_context` never runs the task inline, even when called from the
//!   context's own thread.
//! - On event-loop and worker contexts, tasks submitted in sequence run in
//!   that sequence; at most one task of the context runs at any instant.
//! - A panicking task is routed to the context exception handler, falling
//!   back to the runtime-wide handler, falling back to an error log.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::reactor::Reactor;
use crate::core::task_queue::{Task, TaskExecutor, TaskQueue};
use crate::core::worker::WorkerPool;
use crate::error::{panic_message, BoxError};

/// Handler invoked with the payload of a panicking context task.
pub type ExceptionHandler = Arc<dyn Fn(&(dyn Any + Send)) + Send + Sync>;

/// Scheduling discipline of a [`Context`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextKind {
    /// Pinned to one reactor thread; strict FIFO execution.
    EventLoop,
    /// Serialized over the blocking worker pool; FIFO, but successive tasks
    /// may land on different pool threads.
    Worker,
    /// Runs straight on the worker pool with no ordering between tasks.
    MultiThreadedWorker,
}

struct ContextInner {
    id: String,
    kind: ContextKind,
    /// Present iff `kind == EventLoop`.
    reactor: Option<Arc<Reactor>>,
    worker_pool: Arc<WorkerPool>,
    internal_pool: Arc<WorkerPool>,
    ordered_tasks: Arc<TaskQueue>,
    internal_ordered_tasks: Arc<TaskQueue>,
    data: Mutex<HashMap<String, Box<dyn Any + Send>>>,
    exception_handler: Mutex<Option<ExceptionHandler>>,
    /// Runtime-wide fallback, shared across all contexts.
    default_exception_handler: Arc<Mutex<Option<ExceptionHandler>>>,
}

/// Cheaply cloneable handle to an execution context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub(crate) fn new(
        id: String,
        kind: ContextKind,
        reactor: Option<Arc<Reactor>>,
        worker_pool: Arc<WorkerPool>,
        internal_pool: Arc<WorkerPool>,
        default_exception_handler: Arc<Mutex<Option<ExceptionHandler>>>,
    ) -> Context {
        debug_assert_eq!(kind == ContextKind::EventLoop, reactor.is_some());
        Context {
            inner: Arc::new(ContextInner {
                id,
                kind,
                reactor,
                worker_pool,
                internal_pool,
                ordered_tasks: TaskQueue::new(),
                internal_ordered_tasks: TaskQueue::new(),
                data: Mutex::new(HashMap::new()),
                exception_handler: Mutex::new(None),
                default_exception_handler,
            }),
        }
    }

    /// Stable identifier, used in logs.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> ContextKind {
        self.inner.kind
    }

    pub fn is_event_loop(&self) -> bool {
        self.inner.kind == ContextKind::EventLoop
    }

    pub fn is_worker(&self) -> bool {
        self.inner.kind == ContextKind::Worker
    }

    pub fn is_multi_threaded_worker(&self) -> bool {
        self.inner.kind == ContextKind::MultiThreadedWorker
    }

    /// Schedules `task` onto this context.
    ///
    /// Always asynchronous. Panics inside `task` are caught and routed to the
    /// exception handler chain.
    pub fn run_on_context(&self, task: impl FnOnce() + Send + 'static) {
        let ctx = self.clone();
        self.dispatch(Box::new(move || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                ctx.handle_exception(payload.as_ref());
            }
        }));
    }

    fn dispatch(&self, task: Task) {
        match self.inner.kind {
            ContextKind::EventLoop => {
                if let Some(reactor) = &self.inner.reactor {
                    reactor.execute(task);
                }
            }
            ContextKind::Worker => {
                // Unsized coercion to the trait object happens at the binding.
                let exec: Arc<dyn TaskExecutor> = self.inner.worker_pool.clone();
                self.inner.ordered_tasks.execute(task, exec);
            }
            ContextKind::MultiThreadedWorker => self.inner.worker_pool.execute(task),
        }
    }

    /// Runs `work` on the blocking worker pool, then `result_handler` back on
    /// this context with the outcome.
    ///
    /// With `ordered == true`, blocking work submitted through this context
    /// runs in submission order (ignored on multi-threaded worker contexts,
    /// which have no ordering to extend). A panic inside `work` surfaces as
    /// an `Err` to the result handler.
    pub fn execute_blocking<T, W, H>(&self, work: W, ordered: bool, result_handler: H)
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T, BoxError> + Send + 'static,
        H: FnOnce(Result<T, BoxError>) + Send + 'static,
    {
        self.blocking_impl(work, ordered, result_handler, false);
    }

    /// Like [`Context::execute_blocking`] but on the internal pool, meant for
    /// runtime and embedder housekeeping that must never queue behind user
    /// blocking work.
    pub fn execute_internal_blocking<T, W, H>(&self, work: W, ordered: bool, result_handler: H)
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T, BoxError> + Send + 'static,
        H: FnOnce(Result<T, BoxError>) + Send + 'static,
    {
        self.blocking_impl(work, ordered, result_handler, true);
    }

    fn blocking_impl<T, W, H>(&self, work: W, ordered: bool, result_handler: H, internal: bool)
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T, BoxError> + Send + 'static,
        H: FnOnce(Result<T, BoxError>) + Send + 'static,
    {
        let ctx = self.clone();
        let task: Task = Box::new(move || {
            let result = match catch_unwind(AssertUnwindSafe(work)) {
                Ok(result) => result,
                Err(payload) => Err(BoxError::from(panic_message(payload.as_ref()).to_string())),
            };
            ctx.run_on_context(move || result_handler(result));
        });
        let pool = if internal {
            &self.inner.internal_pool
        } else {
            &self.inner.worker_pool
        };
        if ordered && self.inner.kind != ContextKind::MultiThreadedWorker {
            let queue = if internal {
                &self.inner.internal_ordered_tasks
            } else {
                &self.inner.ordered_tasks
            };
            let exec: Arc<dyn TaskExecutor> = pool.clone();
            queue.execute(task, exec);
        } else {
            pool.execute(task);
        }
    }

    /// Installs the context-local exception handler.
    pub fn set_exception_handler(
        &self,
        handler: impl Fn(&(dyn Any + Send)) + Send + Sync + 'static,
    ) {
        *self.inner.exception_handler.lock() = Some(Arc::new(handler));
    }

    pub(crate) fn handle_exception(&self, payload: &(dyn Any + Send)) {
        let handler = {
            let local = self.inner.exception_handler.lock().clone();
            local.or_else(|| self.inner.default_exception_handler.lock().clone())
        };
        match handler {
            Some(handler) => handler(payload),
            None => log::error!(
                "unhandled exception on {}: {}",
                self.inner.id,
                panic_message(payload)
            ),
        }
    }

    /// Stores a value in the context-local data map.
    pub fn put(&self, key: impl Into<String>, value: impl Any + Send) {
        self.inner.data.lock().insert(key.into(), Box::new(value));
    }

    /// Fetches a clone of a context-local value, if present with type `T`.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.inner
            .data
            .lock()
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Removes a context-local value. Returns whether the key was present.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.data.lock().remove(key).is_some()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .finish()
    }
}
