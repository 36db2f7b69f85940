//! # Messages.
//!
//! A [`Message`] is what a consumer handler receives: address, headers, a
//! lazily transformed body and, for `send`/`request` deliveries, a reply
//! address to answer on.
//!
//! ## Rules
//! - The sender's body is never handed out directly. Each receiving copy
//!   materializes its own body through the codec's local transform, on first
//!   access.
//! - Replying to a message that carries no reply address is a silent no-op.

use std::any::Any;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;

use crate::bus::codec::MessageCodec;
use crate::bus::event_bus::{BusInner, ReplyHandler};
use crate::bus::options::{DeliveryOptions, Headers};
use crate::core::context::Context;
use crate::error::{BusError, ReplyError};

/// A single delivery of a body to one receiver.
pub struct Message {
    pub(crate) address: String,
    pub(crate) reply_address: Option<String>,
    pub(crate) headers: Headers,
    pub(crate) codec: Arc<dyn MessageCodec>,
    /// Body as the sender provided it; shared across all receiving copies.
    pub(crate) sent: Arc<dyn Any + Send + Sync>,
    /// This receiver's transformed body, materialized on first access.
    pub(crate) received: OnceCell<Box<dyn Any + Send + Sync>>,
    pub(crate) send: bool,
    pub(crate) bus: Weak<BusInner>,
}

impl Message {
    /// Address the message was sent or published to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Reply address, present for `send`/`request` deliveries.
    pub fn reply_address(&self) -> Option<&str> {
        self.reply_address.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable headers, available to interceptors.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// `true` for point-to-point deliveries, `false` for publishes.
    pub fn is_send(&self) -> bool {
        self.send
    }

    /// This receiver's body copy.
    pub fn body(&self) -> &(dyn Any + Send + Sync) {
        self.received
            .get_or_init(|| self.codec.transform(self.sent.as_ref()))
            .as_ref()
    }

    /// The body downcast to `T`, if that is its runtime type.
    pub fn body_as<T: Any>(&self) -> Option<&T> {
        self.body().downcast_ref::<T>()
    }

    /// Replies with default delivery options.
    pub fn reply<B: Any + Send + Sync>(&self, body: B) -> Result<(), BusError> {
        self.reply_with(body, DeliveryOptions::new())
    }

    /// Replies with explicit delivery options.
    pub fn reply_with<B: Any + Send + Sync>(
        &self,
        body: B,
        options: DeliveryOptions,
    ) -> Result<(), BusError> {
        let Some(addr) = self.reply_address.as_deref() else {
            return Ok(());
        };
        let bus = self.bus.upgrade().ok_or(BusError::NotStarted)?;
        bus.send_or_publish(addr, body, options, true, None)
    }

    /// Replies and expects an answer to the reply, continuing the
    /// conversation on `ctx`.
    pub fn reply_and_request<B, H>(
        &self,
        ctx: &Context,
        body: B,
        options: DeliveryOptions,
        reply_handler: H,
    ) -> Result<(), BusError>
    where
        B: Any + Send + Sync,
        H: FnOnce(Result<Message, ReplyError>) + Send + 'static,
    {
        let Some(addr) = self.reply_address.as_deref() else {
            return Ok(());
        };
        let bus = self.bus.upgrade().ok_or(BusError::NotStarted)?;
        let handler: ReplyHandler = Box::new(reply_handler);
        bus.send_or_publish(addr, body, options, true, Some((ctx.clone(), handler)))
    }

    /// Signals failure to the requester with an application code and message.
    pub fn fail(&self, code: i32, message: impl Into<String>) -> Result<(), BusError> {
        self.reply(ReplyError::recipient(code, message))
    }

    /// Fresh copy for one receiver, sharing the sent body but not the
    /// transformed one.
    pub(crate) fn copy_for_receive(&self) -> Message {
        Message {
            address: self.address.clone(),
            reply_address: self.reply_address.clone(),
            headers: self.headers.clone(),
            codec: Arc::clone(&self.codec),
            sent: Arc::clone(&self.sent),
            received: OnceCell::new(),
            send: self.send,
            bus: Weak::clone(&self.bus),
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("address", &self.address)
            .field("reply_address", &self.reply_address)
            .field("send", &self.send)
            .field("codec", &self.codec.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;
    use bytes::{Bytes, BytesMut};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCodec {
        transforms: AtomicUsize,
    }

    impl MessageCodec for CountingCodec {
        fn name(&self) -> &str {
            "counting"
        }

        fn encode_to_wire(
            &self,
            _buf: &mut BytesMut,
            _body: &(dyn Any + Send + Sync),
        ) -> Result<(), CodecError> {
            Ok(())
        }

        fn decode_from_wire(
            &self,
            _buf: &mut Bytes,
        ) -> Result<Box<dyn Any + Send + Sync>, CodecError> {
            Ok(Box::new(0i32))
        }

        fn transform(&self, body: &(dyn Any + Send + Sync)) -> Box<dyn Any + Send + Sync> {
            self.transforms.fetch_add(1, Ordering::SeqCst);
            Box::new(*body.downcast_ref::<i32>().unwrap())
        }
    }

    fn message(codec: Arc<dyn MessageCodec>) -> Message {
        Message {
            address: "addr".into(),
            reply_address: None,
            headers: Headers::new(),
            codec,
            sent: Arc::new(41i32),
            received: OnceCell::new(),
            send: true,
            bus: Weak::new(),
        }
    }

    #[test]
    fn test_body_transforms_once_per_copy() {
        let codec = Arc::new(CountingCodec {
            transforms: AtomicUsize::new(0),
        });
        let msg = message(Arc::clone(&codec) as Arc<dyn MessageCodec>);
        assert_eq!(codec.transforms.load(Ordering::SeqCst), 0);
        assert_eq!(msg.body_as::<i32>(), Some(&41));
        assert_eq!(msg.body_as::<i32>(), Some(&41));
        assert_eq!(codec.transforms.load(Ordering::SeqCst), 1);

        let copy = msg.copy_for_receive();
        assert_eq!(copy.body_as::<i32>(), Some(&41));
        assert_eq!(codec.transforms.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reply_without_reply_address_is_a_noop() {
        let codec = Arc::new(CountingCodec {
            transforms: AtomicUsize::new(0),
        });
        let msg = message(codec);
        assert!(msg.reply(1i32).is_ok());
        assert!(msg.fail(1, "x").is_ok());
    }
}
