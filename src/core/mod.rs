//! # Execution core.
//!
//! Scheduling model under the event bus: a fixed pool of reactor threads,
//! two elastic blocking pools, per-context ordered task queues, timers and
//! the blocked-thread monitor.

pub(crate) mod config;
pub(crate) mod context;
pub(crate) mod monitor;
pub(crate) mod reactor;
pub(crate) mod runtime;
pub(crate) mod task_queue;
pub(crate) mod timer;
pub(crate) mod worker;

pub use config::RuntimeConfig;
pub use context::{Context, ContextKind, ExceptionHandler};
pub use runtime::Runtime;
