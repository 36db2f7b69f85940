//! # Event bus.
//!
//! Addressable in-process messaging: point-to-point with round-robin,
//! publish/subscribe, request/reply with timeouts, pluggable codecs,
//! pause/resume buffering and credit-based producer backpressure.
//!
//! Stream-like capabilities are small standalone traits composed per type
//! rather than one deep read/write-stream hierarchy: a consumer is
//! [`Pausable`] + [`Endable`], a producer is [`Drainable`] + [`Endable`].

pub(crate) mod codec;
pub(crate) mod codecs;
pub(crate) mod event_bus;
pub(crate) mod message;
pub(crate) mod options;
pub(crate) mod producer;
pub(crate) mod registration;

pub use codec::MessageCodec;
pub use event_bus::{DeliveryContext, EventBus, ReplyHandler};
pub use message::Message;
pub use options::{DeliveryOptions, Headers, DEFAULT_TIMEOUT};
pub use producer::{MessageProducer, DEFAULT_WRITE_QUEUE_MAX_SIZE};
pub use registration::{MessageConsumer, DEFAULT_MAX_BUFFERED};

/// Inbound flow control: stop and restart delivery without losing messages.
pub trait Pausable {
    /// Buffers inbound messages instead of delivering them.
    fn pause(&self);

    /// Replays buffered messages in arrival order and resumes delivery.
    fn resume(&self);
}

/// Outbound flow control for credit-managed writers.
pub trait Drainable {
    /// Whether the writer is out of credits and queueing locally.
    fn write_queue_full(&self) -> bool;

    /// Registers a one-shot callback fired when the writer has drained back
    /// to half capacity. Re-register for repeated notifications.
    fn drain_handler(&self, handler: Box<dyn FnOnce() + Send>);
}

/// Terminal lifecycle of a stream-like handle.
pub trait Endable {
    /// Permanently ends the handle; no further traffic flows through it.
    fn end(&self);
}
