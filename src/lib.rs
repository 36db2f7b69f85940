//! # corebus
//!
//! **Corebus** is an embeddable asynchronous runtime: contexts with strict
//! per-context task ordering over a fixed reactor pool and elastic blocking
//! pools, paired with an in-process addressable event bus (point-to-point,
//! publish/subscribe, request/reply) with pluggable codecs and credit-based
//! backpressure.
//!
//! ## Architecture
//! ```text
//!  user code                         user code
//!      │ run_on_context                  │ send / publish / request
//!      ▼                                 ▼
//! ┌──────────────┐              ┌─────────────────────────────────┐
//! │   Context    │◄─────────────│            EventBus             │
//! │ (EventLoop / │  deliveries  │  - CodecManager (type → codec)  │
//! │  Worker /    │  run on the  │  - interceptor chain            │
//! │  MT-Worker)  │  consumer's  │  - address → registration list  │
//! └──────┬───────┘  context     │    (round-robin / fan-out)      │
//!        │                      └────────────────┬────────────────┘
//!        ▼                                       ▼
//! ┌─────────────────────────────┐   ┌──────────────────────────────┐
//! │ TaskQueue (FIFO, hops       │   │ MessageConsumer (pause /     │
//! │ between executors)          │   │ resume buffer, reply timers) │
//! └──────┬──────────────────────┘   │ MessageProducer (credits)    │
//!        ▼                          └──────────────────────────────┘
//! ┌─────────────────────────────────────────────────┐
//! │ Runtime: reactor pool │ worker pool │ internal   │
//! │ pool │ timer core │ blocked-thread monitor       │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//! | Area            | Description                                               | Key types / traits                          |
//! |-----------------|-----------------------------------------------------------|---------------------------------------------|
//! | **Scheduling**  | Ordered contexts over reactors and blocking pools.        | [`Runtime`], [`Context`], [`ContextKind`]   |
//! | **Messaging**   | Addressable send/publish/request with reply correlation.  | [`EventBus`], [`Message`]                   |
//! | **Codecs**      | Type-directed payload encode/decode/transform.            | [`MessageCodec`], [`DeliveryOptions`]       |
//! | **Flow control**| Pause/resume buffering and credit-based backpressure.     | [`MessageConsumer`], [`MessageProducer`], [`Pausable`], [`Drainable`] |
//! | **Diagnostics** | Blocked-thread detection and context exception routing.   | [`RuntimeConfig`]                           |
//! | **Errors**      | Typed sync preconditions and async reply failures.        | [`BusError`], [`ReplyError`], [`RuntimeError`] |
//!
//! ## Example
//! ```rust
//! use corebus::{DeliveryOptions, Runtime};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rt = Runtime::new()?;
//!     let bus = rt.event_bus();
//!     let ctx = rt.event_loop_context();
//!
//!     // Consumers go live once a handler is attached.
//!     let consumer = bus.consumer(&ctx, "greetings")?;
//!     consumer.handler(|msg| {
//!         let name = msg.body_as::<String>().unwrap().clone();
//!         msg.reply(format!("hello, {name}")).unwrap();
//!     })?;
//!
//!     let (tx, rx) = std::sync::mpsc::channel();
//!     bus.request(
//!         &ctx,
//!         "greetings",
//!         String::from("world"),
//!         DeliveryOptions::new(),
//!         move |res| {
//!             let _ = tx.send(res.map(|m| m.body_as::<String>().unwrap().clone()));
//!         },
//!     )?;
//!     assert_eq!(rx.recv()?.unwrap(), "hello, world");
//!
//!     rt.close();
//!     Ok(())
//! }
//! ```

mod bus;
mod core;
mod error;

// ---- Public re-exports ----

pub use crate::bus::{
    DeliveryContext, DeliveryOptions, Drainable, Endable, EventBus, Headers, Message,
    MessageCodec, MessageConsumer, MessageProducer, Pausable, ReplyHandler, DEFAULT_MAX_BUFFERED,
    DEFAULT_TIMEOUT, DEFAULT_WRITE_QUEUE_MAX_SIZE,
};
pub use crate::core::{Context, ContextKind, ExceptionHandler, Runtime, RuntimeConfig};
pub use crate::error::{
    panic_message, BoxError, BusError, CodecError, ReplyError, ReplyFailure, RuntimeError,
};
