//! # Consumer registrations.
//!
//! A [`MessageConsumer`] is one subscription on one address. It becomes live
//! when a handler is attached and stays live until unregistered (explicitly,
//! by reply timeout, or by bus close). The terminal state is permanent; a
//! consumer is never re-registered.
//!
//! ## Rules
//! - The handler always runs on the consumer's context, one message per
//!   context turn, never re-entrantly.
//! - `pause` buffers inbound messages (bounded, default 1000) instead of
//!   dropping them; past capacity the discard handler takes over, else the
//!   message is logged and dropped.
//! - `resume` replays the buffer in arrival order.
//! - A reply registration accepts exactly one delivery, cancels its timeout
//!   timer and unregisters itself.
//! - Delivering a message that carries a credit-return header sends one
//!   credit back to the producer before the handler runs.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::bus::event_bus::{BusInner, HandlerHolder, ReplyHandler};
use crate::bus::message::Message;
use crate::bus::options::DeliveryOptions;
use crate::bus::producer::CREDIT_ADDRESS_HEADER;
use crate::bus::Pausable;
use crate::core::context::Context;
use crate::error::{BusError, ReplyError};

/// Default bound of the paused-message buffer.
pub const DEFAULT_MAX_BUFFERED: usize = 1000;

type ConsumerHandler = Arc<dyn Fn(Message) + Send + Sync>;

struct ConsumerState {
    registered: bool,
    /// Terminal; set on the first unregistration and never cleared.
    ended: bool,
    paused: bool,
    handler: Option<ConsumerHandler>,
    pending: VecDeque<Message>,
    max_buffered: usize,
    discard_handler: Option<ConsumerHandler>,
    end_handler: Option<Box<dyn FnOnce() + Send>>,
    completion_handler: Option<Box<dyn FnOnce(Result<(), BusError>) + Send>>,
}

pub(crate) struct ConsumerInner {
    bus: Weak<BusInner>,
    address: String,
    context: Context,
    local_only: bool,
    /// Set for reply registrations; they bypass the buffering path.
    reply: bool,
    reply_handler: Mutex<Option<ReplyHandler>>,
    timeout_timer: Mutex<Option<u64>>,
    holder: Mutex<Option<Arc<HandlerHolder>>>,
    state: Mutex<ConsumerState>,
}

impl ConsumerInner {
    fn build(
        bus: Weak<BusInner>,
        address: String,
        context: Context,
        local_only: bool,
        reply: bool,
    ) -> Arc<ConsumerInner> {
        Arc::new(ConsumerInner {
            bus,
            address,
            context,
            local_only,
            reply,
            reply_handler: Mutex::new(None),
            timeout_timer: Mutex::new(None),
            holder: Mutex::new(None),
            state: Mutex::new(ConsumerState {
                registered: false,
                ended: false,
                paused: false,
                handler: None,
                pending: VecDeque::new(),
                max_buffered: DEFAULT_MAX_BUFFERED,
                discard_handler: None,
                end_handler: None,
                completion_handler: None,
            }),
        })
    }

    pub(crate) fn new(
        bus: Weak<BusInner>,
        address: String,
        context: Context,
        local_only: bool,
    ) -> Arc<ConsumerInner> {
        ConsumerInner::build(bus, address, context, local_only, false)
    }

    pub(crate) fn new_reply(
        bus: Weak<BusInner>,
        address: String,
        context: Context,
        handler: ReplyHandler,
    ) -> Arc<ConsumerInner> {
        let inner = ConsumerInner::build(bus, address, context, true, true);
        *inner.reply_handler.lock() = Some(handler);
        inner.state.lock().registered = true;
        inner
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }

    pub(crate) fn set_holder(&self, holder: Arc<HandlerHolder>) {
        *self.holder.lock() = Some(holder);
    }

    pub(crate) fn set_timeout_timer(&self, id: u64) {
        *self.timeout_timer.lock() = Some(id);
    }

    /// Entry point from the bus; already running as a task on `context`.
    pub(crate) fn dispatch(self: &Arc<Self>, msg: Message) {
        if self.reply {
            self.dispatch_reply(msg);
            return;
        }
        enum Action {
            Deliver(ConsumerHandler, Message),
            Discard(Option<ConsumerHandler>, Message),
            Buffered,
        }
        let action = {
            let mut st = self.state.lock();
            if !st.registered {
                Action::Discard(st.discard_handler.clone(), msg)
            } else if st.paused || !st.pending.is_empty() {
                if st.pending.len() >= st.max_buffered {
                    Action::Discard(st.discard_handler.clone(), msg)
                } else {
                    st.pending.push_back(msg);
                    Action::Buffered
                }
            } else {
                match st.handler.clone() {
                    Some(handler) => Action::Deliver(handler, msg),
                    None => Action::Discard(st.discard_handler.clone(), msg),
                }
            }
        };
        match action {
            Action::Deliver(handler, msg) => self.deliver(&handler, msg),
            Action::Discard(discard, msg) => self.discard(discard, msg),
            Action::Buffered => {}
        }
    }

    fn dispatch_reply(self: &Arc<Self>, msg: Message) {
        // Exactly one delivery: tear down first so a racing timeout loses.
        self.unregister_internal(false);
        if let Some(handler) = self.reply_handler.lock().take() {
            let failure = msg.body_as::<ReplyError>().cloned();
            match failure {
                Some(err) => handler(Err(err)),
                None => handler(Ok(msg)),
            }
        }
    }

    /// Fails the pending reply; must already run on the consumer's context.
    pub(crate) fn fail_reply(self: &Arc<Self>, err: ReplyError) {
        self.unregister_internal(false);
        if let Some(handler) = self.reply_handler.lock().take() {
            handler(Err(err));
        }
    }

    /// Schedules [`ConsumerInner::fail_reply`] onto the consumer's context.
    pub(crate) fn fail_reply_async(self: &Arc<Self>, err: ReplyError) {
        let this = Arc::clone(self);
        self.context.run_on_context(move || this.fail_reply(err));
    }

    fn deliver(&self, handler: &ConsumerHandler, msg: Message) {
        let credit_addr = msg.headers().get(CREDIT_ADDRESS_HEADER).map(str::to_string);
        if let (Some(addr), Some(bus)) = (credit_addr, self.bus.upgrade()) {
            let _ = bus.send_or_publish(&addr, 1i32, DeliveryOptions::new(), true, None);
        }
        handler(msg);
    }

    fn discard(&self, discard: Option<ConsumerHandler>, msg: Message) {
        match discard {
            Some(handler) => handler(msg),
            None => log::warn!(
                "discarding message sent to {}: consumer buffer is full or gone",
                self.address
            ),
        }
    }

    /// Delivers at most one buffered message per context turn, rescheduling
    /// itself while the buffer stays non-empty.
    fn check_next_tick(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.context.run_on_context(move || {
            let next = {
                let mut st = this.state.lock();
                if st.paused || !st.registered {
                    return;
                }
                match (st.pending.pop_front(), st.handler.clone()) {
                    (Some(msg), Some(handler)) => Some((handler, msg)),
                    _ => None,
                }
            };
            if let Some((handler, msg)) = next {
                this.deliver(&handler, msg);
                let more = {
                    let st = this.state.lock();
                    st.registered && !st.paused && !st.pending.is_empty()
                };
                if more {
                    this.check_next_tick();
                }
            }
        });
    }

    pub(crate) fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub(crate) fn resume(self: &Arc<Self>) {
        let drain = {
            let mut st = self.state.lock();
            st.paused = false;
            st.registered && !st.pending.is_empty()
        };
        if drain {
            self.check_next_tick();
        }
    }

    pub(crate) fn unregister_internal(self: &Arc<Self>, _from_bus_close: bool) {
        let (holder, dropped, discard, end) = {
            let mut st = self.state.lock();
            if st.ended {
                return;
            }
            st.registered = false;
            st.ended = true;
            (
                self.holder.lock().take(),
                std::mem::take(&mut st.pending),
                st.discard_handler.clone(),
                st.end_handler.take(),
            )
        };
        if let Some(id) = self.timeout_timer.lock().take() {
            if let Some(bus) = self.bus.upgrade() {
                bus.cancel_timer(id);
            }
        }
        if let Some(holder) = holder {
            holder.removed.store(true, Ordering::Release);
            if let Some(bus) = self.bus.upgrade() {
                bus.remove_registration(&self.address, &holder);
            }
        }
        for msg in dropped {
            self.discard(discard.clone(), msg);
        }
        if let Some(end) = end {
            self.context.run_on_context(end);
        }
    }
}

/// Live (or not-yet-live) subscription on one bus address.
#[derive(Clone)]
pub struct MessageConsumer {
    inner: Arc<ConsumerInner>,
}

impl MessageConsumer {
    pub(crate) fn from_inner(inner: Arc<ConsumerInner>) -> MessageConsumer {
        MessageConsumer { inner }
    }

    pub fn address(&self) -> &str {
        self.inner.address()
    }

    /// Whether the registration is visible to the local bus only.
    ///
    /// Always effectively true in a single-process bus; kept so user code
    /// carries the right intent into a clustered deployment.
    pub fn is_local_only(&self) -> bool {
        self.inner.local_only
    }

    /// Attaches the handler, registering the consumer on first attach.
    ///
    /// Fails with [`BusError::NotRegistered`] once the consumer reached its
    /// terminal unregistered state.
    pub fn handler(
        &self,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<(), BusError> {
        let bus = self.inner.bus.upgrade().ok_or(BusError::NotStarted)?;
        let register = {
            let mut st = self.inner.state.lock();
            if st.ended {
                return Err(BusError::NotRegistered);
            }
            st.handler = Some(Arc::new(handler));
            if st.registered {
                false
            } else {
                st.registered = true;
                true
            }
        };
        if register {
            if let Err(e) = bus.add_registration(&self.inner) {
                let mut st = self.inner.state.lock();
                st.registered = false;
                st.ended = true;
                return Err(e);
            }
            let completion = self.inner.state.lock().completion_handler.take();
            if let Some(completion) = completion {
                self.inner.context.run_on_context(move || completion(Ok(())));
            }
        }
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.inner.state.lock().registered
    }

    /// Resizes the paused-message buffer; shrinking discards the oldest
    /// buffered messages.
    pub fn set_max_buffered(&self, max: usize) {
        let overflow: Vec<Message> = {
            let mut st = self.inner.state.lock();
            st.max_buffered = max;
            let mut out = Vec::new();
            while st.pending.len() > max {
                if let Some(msg) = st.pending.pop_front() {
                    out.push(msg);
                }
            }
            out
        };
        let discard = self.inner.state.lock().discard_handler.clone();
        for msg in overflow {
            self.inner.discard(discard.clone(), msg);
        }
    }

    /// Receives messages that had to be dropped (buffer overflow or
    /// unregistration with a non-empty buffer).
    pub fn discard_handler(&self, handler: impl Fn(Message) + Send + Sync + 'static) {
        self.inner.state.lock().discard_handler = Some(Arc::new(handler));
    }

    /// Invoked once, on the consumer's context, when the consumer reaches its
    /// terminal unregistered state.
    pub fn end_handler(&self, handler: impl FnOnce() + Send + 'static) {
        self.inner.state.lock().end_handler = Some(Box::new(handler));
    }

    /// Reports registration completion on the consumer's context.
    ///
    /// Registration in a single-process bus always succeeds; the result shape
    /// keeps user code compatible with distributed registration.
    pub fn completion_handler(&self, handler: impl FnOnce(Result<(), BusError>) + Send + 'static) {
        let registered = {
            let st = self.inner.state.lock();
            st.registered
        };
        if registered {
            self.inner.context.run_on_context(move || handler(Ok(())));
        } else {
            self.inner.state.lock().completion_handler = Some(Box::new(handler));
        }
    }

    /// Removes the registration. Buffered messages go to the discard handler.
    pub fn unregister(&self) {
        self.inner.unregister_internal(false);
    }
}

impl Pausable for MessageConsumer {
    fn pause(&self) {
        self.inner.pause();
    }

    fn resume(&self) {
        self.inner.resume();
    }
}

impl crate::bus::Endable for MessageConsumer {
    fn end(&self) {
        self.unregister();
    }
}

impl std::fmt::Debug for MessageConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("address", &self.inner.address)
            .field("registered", &self.is_registered())
            .finish()
    }
}
