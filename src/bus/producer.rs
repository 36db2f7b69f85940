//! # Message producers.
//!
//! A [`MessageProducer`] is a reusable sending handle for one address. In
//! send mode it implements credit-based backpressure:
//!
//! ```text
//!   producer ── message (+ credit-return header) ──► consumer
//!      ▲                                                │
//!      └────────── 1 credit per delivered message ──────┘
//! ```
//!
//! ## Rules
//! - The producer starts with a full credit budget (default 1000); each write
//!   consumes one credit, writes without credit queue locally.
//! - An inbound credit grant replenishes the counter and flushes queued
//!   writes, oldest first, as far as credits allow.
//! - The drain handler fires once when credits climb back to at least half of
//!   the configured maximum, then clears.
//! - Publish-mode producers have no credit accounting; publish is best effort.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::bus::codec::MessageCodec;
use crate::bus::event_bus::BusInner;
use crate::bus::options::DeliveryOptions;
use crate::bus::registration::MessageConsumer;
use crate::bus::{Drainable, Endable};
use crate::core::context::Context;
use crate::error::BusError;

/// Header carrying the producer's private credit-return address.
pub(crate) const CREDIT_ADDRESS_HEADER: &str = "__corebus.credit-address";

/// Default credit budget, equal to the default write-queue max size.
pub const DEFAULT_WRITE_QUEUE_MAX_SIZE: usize = 1000;

struct PendingWrite {
    body: Arc<dyn Any + Send + Sync>,
    codec: Arc<dyn MessageCodec>,
}

struct ProducerState {
    credits: usize,
    max_size: usize,
    pending: VecDeque<PendingWrite>,
    drain: Option<Box<dyn FnOnce() + Send>>,
    closed: bool,
}

pub(crate) struct ProducerInner {
    bus: Weak<BusInner>,
    context: Context,
    address: String,
    send_mode: bool,
    /// Private inbound address for credit grants; send mode only.
    credit_address: Option<String>,
    options: Mutex<DeliveryOptions>,
    state: Mutex<ProducerState>,
    credit_consumer: Mutex<Option<MessageConsumer>>,
}

impl ProducerInner {
    fn deliver(&self, body: Arc<dyn Any + Send + Sync>, codec: Arc<dyn MessageCodec>) {
        let bus = match self.bus.upgrade() {
            Some(bus) => bus,
            None => return,
        };
        let mut options = self.options.lock().clone();
        if let Some(addr) = &self.credit_address {
            options.headers_mut().set(CREDIT_ADDRESS_HEADER, addr.clone());
        }
        if let Err(err) =
            bus.send_or_publish_prepared(&self.address, body, codec, options, self.send_mode, None)
        {
            log::warn!(
                "producer for {} failed to deliver: {}",
                self.address,
                err.as_label()
            );
        }
    }

    pub(crate) fn receive_credit(self: &Arc<Self>, amount: i32) {
        if amount <= 0 {
            return;
        }
        let (flushed, drain) = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.credits += amount as usize;
            let mut flushed = Vec::new();
            while st.credits > 0 {
                match st.pending.pop_front() {
                    Some(write) => {
                        st.credits -= 1;
                        flushed.push(write);
                    }
                    None => break,
                }
            }
            let drain = if st.credits >= st.max_size / 2 {
                st.drain.take()
            } else {
                None
            };
            (flushed, drain)
        };
        for write in flushed {
            self.deliver(write.body, write.codec);
        }
        if let Some(drain) = drain {
            self.context.run_on_context(drain);
        }
    }
}

/// Sending handle bound to one address, in send or publish mode.
#[derive(Clone)]
pub struct MessageProducer {
    inner: Arc<ProducerInner>,
}

impl MessageProducer {
    /// Wires up the producer; send mode also registers its credit consumer.
    pub(crate) fn create(
        bus: &Arc<BusInner>,
        ctx: &Context,
        address: String,
        send_mode: bool,
    ) -> Result<MessageProducer, BusError> {
        let credit_address = if send_mode {
            Some(format!("__corebus.credit.{}", bus.next_producer_id()))
        } else {
            None
        };
        let inner = Arc::new(ProducerInner {
            bus: Arc::downgrade(bus),
            context: ctx.clone(),
            address,
            send_mode,
            credit_address: credit_address.clone(),
            options: Mutex::new(DeliveryOptions::new()),
            state: Mutex::new(ProducerState {
                credits: DEFAULT_WRITE_QUEUE_MAX_SIZE,
                max_size: DEFAULT_WRITE_QUEUE_MAX_SIZE,
                pending: VecDeque::new(),
                drain: None,
                closed: false,
            }),
            credit_consumer: Mutex::new(None),
        });
        if let Some(credit_address) = credit_address {
            let consumer = bus.make_consumer(ctx, &credit_address, true)?;
            let target = Arc::downgrade(&inner);
            consumer.handler(move |msg| {
                if let (Some(inner), Some(amount)) = (target.upgrade(), msg.body_as::<i32>()) {
                    inner.receive_credit(*amount);
                }
            })?;
            *inner.credit_consumer.lock() = Some(consumer);
        }
        Ok(MessageProducer { inner })
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// `true` for `sender` producers, `false` for `publisher` producers.
    pub fn is_send_mode(&self) -> bool {
        self.inner.send_mode
    }

    /// Replaces the delivery options applied to subsequent writes.
    pub fn delivery_options(&self, options: DeliveryOptions) {
        *self.inner.options.lock() = options;
    }

    /// Writes one message through the producer.
    ///
    /// Codec resolution happens here, so an unresolvable body type fails
    /// synchronously even when the write itself would have been queued.
    pub fn write<B: Any + Send + Sync>(&self, body: B) -> Result<(), BusError> {
        let bus = self.inner.bus.upgrade().ok_or(BusError::NotStarted)?;
        let codec_name = self.inner.options.lock().codec_name().map(str::to_string);
        let codec = bus
            .codecs()
            .lookup(&body, std::any::type_name::<B>(), codec_name.as_deref())?;
        let body: Arc<dyn Any + Send + Sync> = Arc::new(body);
        if !self.inner.send_mode {
            self.inner.deliver(body, codec);
            return Ok(());
        }
        let has_credit = {
            let mut st = self.inner.state.lock();
            if st.closed {
                return Err(BusError::NotRegistered);
            }
            if st.credits > 0 {
                st.credits -= 1;
                true
            } else {
                st.pending.push_back(PendingWrite { body: Arc::clone(&body), codec: Arc::clone(&codec) });
                false
            }
        };
        if has_credit {
            self.inner.deliver(body, codec);
        }
        Ok(())
    }

    /// Resizes the credit budget, adjusting outstanding credits by the delta.
    pub fn set_write_queue_max_size(&self, max: usize) {
        let mut st = self.inner.state.lock();
        let delta = max as i64 - st.max_size as i64;
        st.max_size = max;
        st.credits = (st.credits as i64 + delta).max(0) as usize;
    }

    /// Unregisters the credit consumer and drops queued writes.
    pub fn close(&self) {
        let consumer = self.inner.credit_consumer.lock().take();
        if let Some(consumer) = consumer {
            consumer.unregister();
        }
        let mut st = self.inner.state.lock();
        st.closed = true;
        st.pending.clear();
        st.drain = None;
    }
}

impl Drainable for MessageProducer {
    fn write_queue_full(&self) -> bool {
        if !self.inner.send_mode {
            return false;
        }
        self.inner.state.lock().credits == 0
    }

    fn drain_handler(&self, handler: Box<dyn FnOnce() + Send>) {
        let fire_now = {
            let mut st = self.inner.state.lock();
            if st.closed {
                return;
            }
            if st.credits >= st.max_size / 2 {
                Some(handler)
            } else {
                st.drain = Some(handler);
                None
            }
        };
        if let Some(handler) = fire_now {
            self.inner.context.run_on_context(handler);
        }
    }
}

impl Endable for MessageProducer {
    fn end(&self) {
        self.close();
    }
}

impl std::fmt::Debug for MessageProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProducer")
            .field("address", &self.inner.address)
            .field("send_mode", &self.inner.send_mode)
            .finish()
    }
}
