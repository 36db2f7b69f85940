//! # Event bus.
//!
//! In-process addressable messaging on top of the context model:
//!
//! ```text
//!   send ────► codec lookup ──► interceptors ──► round-robin ──► one consumer
//!   publish ─► codec lookup ──► interceptors ──► fan-out ──────► every consumer
//!   request ─► reply registration + timeout, then the send path
//! ```
//!
//! ## Rules
//! - Codec resolution failures are synchronous; routing failures (no
//!   handlers, timeout) surface asynchronously through the reply handler.
//! - Every delivery runs on the consumer's context and hands the consumer a
//!   freshly transformed body copy.
//! - Round-robin selection is best effort: a registration list mutating
//!   concurrently with selection may skip or repeat a consumer; the index
//!   restarts at zero rather than failing.
//! - A panicking interceptor is logged and the chain continues.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::bus::codec::{CodecManager, MessageCodec};
use crate::bus::message::Message;
use crate::bus::options::DeliveryOptions;
use crate::bus::producer::MessageProducer;
use crate::bus::registration::{ConsumerInner, MessageConsumer};
use crate::core::context::Context;
use crate::core::runtime::RuntimeCore;
use crate::error::{panic_message, BusError, ReplyError, ReplyFailure};

/// Callback receiving the outcome of a `request`.
pub type ReplyHandler = Box<dyn FnOnce(Result<Message, ReplyError>) + Send>;

/// View of an outbound message handed to each interceptor.
pub struct DeliveryContext<'a> {
    pub(crate) message: &'a mut Message,
}

impl DeliveryContext<'_> {
    pub fn message(&self) -> &Message {
        self.message
    }

    /// Mutable access, e.g. for stamping headers.
    pub fn message_mut(&mut self) -> &mut Message {
        self.message
    }
}

type Interceptor = Arc<dyn Fn(&mut DeliveryContext<'_>) + Send + Sync>;

/// One registration as seen by the routing table.
pub(crate) struct HandlerHolder {
    pub(crate) consumer: Arc<ConsumerInner>,
    pub(crate) context: Context,
    pub(crate) removed: AtomicBool,
}

/// Ordered registration list for one address plus the round-robin cursor.
struct Handlers {
    pos: AtomicUsize,
    list: Mutex<Vec<Arc<HandlerHolder>>>,
}

impl Handlers {
    fn new() -> Handlers {
        Handlers {
            pos: AtomicUsize::new(0),
            list: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, holder: Arc<HandlerHolder>) {
        self.list.lock().push(holder);
    }

    fn remove(&self, holder: &Arc<HandlerHolder>) {
        self.list.lock().retain(|h| !Arc::ptr_eq(h, holder));
    }

    fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<HandlerHolder>> {
        self.list.lock().clone()
    }

    /// Best-effort round-robin pick. A list shrinking mid-selection restarts
    /// the cursor at zero instead of erroring out.
    fn choose(&self) -> Option<Arc<HandlerHolder>> {
        loop {
            let list = self.list.lock();
            let size = list.len();
            if size == 0 {
                return None;
            }
            let p = self.pos.fetch_add(1, Ordering::Relaxed);
            if p >= size - 1 {
                self.pos.store(0, Ordering::Relaxed);
            }
            match list.get(p) {
                Some(holder) => return Some(Arc::clone(holder)),
                None => self.pos.store(0, Ordering::Relaxed),
            }
        }
    }
}

pub(crate) struct BusInner {
    started: AtomicBool,
    handlers: Mutex<HashMap<String, Arc<Handlers>>>,
    codecs: CodecManager,
    interceptors: RwLock<Vec<(u64, Interceptor)>>,
    interceptor_seq: AtomicU64,
    reply_seq: AtomicU64,
    producer_seq: AtomicU64,
    runtime: Weak<RuntimeCore>,
    weak: OnceCell<Weak<BusInner>>,
}

impl BusInner {
    fn check_started(&self) -> Result<(), BusError> {
        if self.started.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BusError::NotStarted)
        }
    }

    fn weak(&self) -> Weak<BusInner> {
        self.weak.get().cloned().unwrap_or_default()
    }

    pub(crate) fn codecs(&self) -> &CodecManager {
        &self.codecs
    }

    pub(crate) fn next_producer_id(&self) -> u64 {
        self.producer_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn cancel_timer(&self, id: u64) {
        if let Some(rt) = self.runtime.upgrade() {
            rt.timers.cancel(id);
        }
    }

    fn arm_reply_timeout(
        &self,
        delay: Duration,
        ctx: Context,
        handler: impl FnOnce(u64) + Send + 'static,
    ) -> Option<u64> {
        let rt = self.runtime.upgrade()?;
        rt.timers
            .set_timer(delay.max(Duration::from_millis(1)), ctx, handler)
            .ok()
    }

    pub(crate) fn make_consumer(
        self: &Arc<Self>,
        ctx: &Context,
        address: &str,
        local_only: bool,
    ) -> Result<MessageConsumer, BusError> {
        self.check_started()?;
        let inner = ConsumerInner::new(self.weak(), address.to_string(), ctx.clone(), local_only);
        Ok(MessageConsumer::from_inner(inner))
    }

    /// Inserts a registration, keeping the address entry alive iff at least
    /// one holder remains.
    pub(crate) fn add_registration(&self, consumer: &Arc<ConsumerInner>) -> Result<(), BusError> {
        self.check_started()?;
        let holder = Arc::new(HandlerHolder {
            consumer: Arc::clone(consumer),
            context: consumer.context().clone(),
            removed: AtomicBool::new(false),
        });
        consumer.set_holder(Arc::clone(&holder));
        let mut map = self.handlers.lock();
        map.entry(consumer.address().to_string())
            .or_insert_with(|| Arc::new(Handlers::new()))
            .add(holder);
        Ok(())
    }

    pub(crate) fn remove_registration(&self, address: &str, holder: &Arc<HandlerHolder>) {
        let mut map = self.handlers.lock();
        if let Some(handlers) = map.get(address) {
            handlers.remove(holder);
            if handlers.is_empty() {
                map.remove(address);
            }
        }
    }

    pub(crate) fn send_or_publish<B: Any + Send + Sync>(
        self: &Arc<Self>,
        address: &str,
        body: B,
        options: DeliveryOptions,
        send: bool,
        reply: Option<(Context, ReplyHandler)>,
    ) -> Result<(), BusError> {
        let codec = self
            .codecs
            .lookup(&body, std::any::type_name::<B>(), options.codec_name())?;
        self.send_or_publish_prepared(address, Arc::new(body), codec, options, send, reply)
    }

    pub(crate) fn send_or_publish_prepared(
        self: &Arc<Self>,
        address: &str,
        sent: Arc<dyn Any + Send + Sync>,
        codec: Arc<dyn MessageCodec>,
        options: DeliveryOptions,
        send: bool,
        reply: Option<(Context, ReplyHandler)>,
    ) -> Result<(), BusError> {
        self.check_started()?;
        let timeout = options.timeout();
        let (reply_address, reply_consumer) = match reply {
            Some((ctx, handler)) => {
                let reply_address = (self.reply_seq.fetch_add(1, Ordering::Relaxed) + 1).to_string();
                let consumer = ConsumerInner::new_reply(
                    self.weak(),
                    reply_address.clone(),
                    ctx.clone(),
                    handler,
                );
                self.add_registration(&consumer)?;
                let timed_out = Arc::clone(&consumer);
                let target = address.to_string();
                let timer = self.arm_reply_timeout(timeout, ctx, move |_| {
                    timed_out.fail_reply(ReplyError::new(
                        ReplyFailure::Timeout,
                        format!(
                            "timed out after {} ms waiting for a reply on address {target}",
                            timeout.as_millis()
                        ),
                    ));
                });
                if let Some(id) = timer {
                    consumer.set_timeout_timer(id);
                }
                (Some(reply_address), Some(consumer))
            }
            None => (None, None),
        };
        let mut msg = Message {
            address: address.to_string(),
            reply_address,
            headers: options.into_headers(),
            codec,
            sent,
            received: OnceCell::new(),
            send,
            bus: self.weak(),
        };
        self.run_interceptors(&mut msg);
        let handlers = self.handlers.lock().get(&msg.address).map(Arc::clone);
        if send {
            match handlers.and_then(|h| h.choose()) {
                Some(holder) => deliver_to_holder(&holder, &msg),
                None => {
                    if let Some(consumer) = reply_consumer {
                        consumer.fail_reply_async(ReplyError::new(
                            ReplyFailure::NoHandlers,
                            format!("no handlers for address {}", msg.address),
                        ));
                    }
                }
            }
        } else if let Some(handlers) = handlers {
            for holder in handlers.snapshot() {
                deliver_to_holder(&holder, &msg);
            }
        }
        Ok(())
    }

    fn run_interceptors(&self, msg: &mut Message) {
        let chain: Vec<Interceptor> = self
            .interceptors
            .read()
            .iter()
            .map(|(_, i)| Arc::clone(i))
            .collect();
        for interceptor in chain {
            let mut dc = DeliveryContext { message: msg };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| interceptor(&mut dc))) {
                log::warn!(
                    "message interceptor panicked, continuing the chain: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    fn close(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        // Drain the table first; unregistration then finds nothing to remove
        // and cannot deadlock against this lock.
        let holders: Vec<Arc<HandlerHolder>> = {
            let mut map = self.handlers.lock();
            map.drain().flat_map(|(_, h)| h.snapshot()).collect()
        };
        for holder in holders {
            holder.removed.store(true, Ordering::Release);
            holder.consumer.unregister_internal(true);
        }
    }
}

fn deliver_to_holder(holder: &Arc<HandlerHolder>, msg: &Message) {
    let copy = msg.copy_for_receive();
    let holder = Arc::clone(holder);
    let ctx = holder.context.clone();
    ctx.run_on_context(move || {
        if !holder.removed.load(Ordering::Acquire) {
            holder.consumer.dispatch(copy);
        }
    });
}

/// Cheaply cloneable handle to the in-process event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub(crate) fn new(runtime: Weak<RuntimeCore>) -> EventBus {
        let inner = Arc::new(BusInner {
            started: AtomicBool::new(false),
            handlers: Mutex::new(HashMap::new()),
            codecs: CodecManager::new(),
            interceptors: RwLock::new(Vec::new()),
            interceptor_seq: AtomicU64::new(0),
            reply_seq: AtomicU64::new(0),
            producer_seq: AtomicU64::new(0),
            runtime,
            weak: OnceCell::new(),
        });
        let _ = inner.weak.set(Arc::downgrade(&inner));
        EventBus { inner }
    }

    /// Opens the bus for registrations and traffic.
    pub fn start(&self) -> Result<(), BusError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(BusError::AlreadyStarted);
        }
        Ok(())
    }

    /// Fire-and-forget point-to-point send with default options.
    pub fn send<B: Any + Send + Sync>(&self, address: &str, body: B) -> Result<(), BusError> {
        self.send_with(address, body, DeliveryOptions::new())
    }

    pub fn send_with<B: Any + Send + Sync>(
        &self,
        address: &str,
        body: B,
        options: DeliveryOptions,
    ) -> Result<(), BusError> {
        self.inner.send_or_publish(address, body, options, true, None)
    }

    /// Point-to-point send expecting a reply, delivered to `reply_handler`
    /// on `ctx`.
    pub fn request<B, H>(
        &self,
        ctx: &Context,
        address: &str,
        body: B,
        options: DeliveryOptions,
        reply_handler: H,
    ) -> Result<(), BusError>
    where
        B: Any + Send + Sync,
        H: FnOnce(Result<Message, ReplyError>) + Send + 'static,
    {
        self.inner.send_or_publish(
            address,
            body,
            options,
            true,
            Some((ctx.clone(), Box::new(reply_handler))),
        )
    }

    /// Best-effort broadcast to every consumer of `address`.
    pub fn publish<B: Any + Send + Sync>(&self, address: &str, body: B) -> Result<(), BusError> {
        self.publish_with(address, body, DeliveryOptions::new())
    }

    pub fn publish_with<B: Any + Send + Sync>(
        &self,
        address: &str,
        body: B,
        options: DeliveryOptions,
    ) -> Result<(), BusError> {
        self.inner.send_or_publish(address, body, options, false, None)
    }

    /// Creates a consumer for `address` whose handler runs on `ctx`.
    ///
    /// The consumer goes live once a handler is attached.
    pub fn consumer(&self, ctx: &Context, address: &str) -> Result<MessageConsumer, BusError> {
        self.inner.make_consumer(ctx, address, false)
    }

    /// Like [`EventBus::consumer`] but never visible beyond this process,
    /// even under a clustered bus.
    pub fn local_consumer(
        &self,
        ctx: &Context,
        address: &str,
    ) -> Result<MessageConsumer, BusError> {
        self.inner.make_consumer(ctx, address, true)
    }

    /// Creates a credit-managed point-to-point producer for `address`.
    pub fn sender(&self, ctx: &Context, address: &str) -> Result<MessageProducer, BusError> {
        self.inner.check_started()?;
        MessageProducer::create(&self.inner, ctx, address.to_string(), true)
    }

    /// Creates a broadcast producer for `address`.
    pub fn publisher(&self, ctx: &Context, address: &str) -> Result<MessageProducer, BusError> {
        self.inner.check_started()?;
        MessageProducer::create(&self.inner, ctx, address.to_string(), false)
    }

    /// Registers a named user codec.
    pub fn register_codec(&self, codec: Arc<dyn MessageCodec>) -> Result<(), BusError> {
        self.inner.codecs.register(codec)
    }

    /// Removes a named user codec. Returns whether it was present.
    pub fn unregister_codec(&self, name: &str) -> bool {
        self.inner.codecs.unregister(name)
    }

    /// Makes `codec` the default for bodies of type `T`.
    pub fn register_default_codec<T: Any>(
        &self,
        codec: Arc<dyn MessageCodec>,
    ) -> Result<(), BusError> {
        self.inner
            .codecs
            .register_default(TypeId::of::<T>(), std::any::type_name::<T>(), codec)
    }

    /// Removes the default codec for `T`. Returns whether one existed.
    pub fn unregister_default_codec<T: Any>(&self) -> bool {
        self.inner.codecs.unregister_default(TypeId::of::<T>())
    }

    /// Appends an interceptor to the outbound chain; returns its id.
    pub fn add_interceptor(
        &self,
        interceptor: impl Fn(&mut DeliveryContext<'_>) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.inner.interceptor_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.interceptors.write().push((id, Arc::new(interceptor)));
        id
    }

    /// Removes an interceptor by id. Returns whether it was present.
    pub fn remove_interceptor(&self, id: u64) -> bool {
        let mut chain = self.inner.interceptors.write();
        let before = chain.len();
        chain.retain(|(i, _)| *i != id);
        chain.len() != before
    }

    /// Unregisters every consumer and refuses further traffic. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Drainable, Pausable};
    use crate::core::config::RuntimeConfig;
    use crate::core::runtime::Runtime;
    use crate::error::CodecError;
    use bytes::{Bytes, BytesMut};
    use std::sync::mpsc;

    fn runtime() -> Runtime {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut cfg = RuntimeConfig::default();
        cfg.event_loop_pool_size = 2;
        cfg.worker_pool_size = 4;
        cfg.internal_blocking_pool_size = 2;
        Runtime::with_config(cfg).unwrap()
    }

    fn recv_all<T>(rx: &mpsc::Receiver<T>, n: usize) -> Vec<T> {
        (0..n)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect()
    }

    #[test]
    fn test_send_round_robins_across_consumers() {
        let rt = runtime();
        let bus = rt.event_bus();
        let (tx, rx) = mpsc::channel();
        for idx in 0..3usize {
            let ctx = rt.event_loop_context();
            let tx = tx.clone();
            let consumer = bus.consumer(&ctx, "jobs").unwrap();
            consumer
                .handler(move |msg| {
                    tx.send((idx, *msg.body_as::<i32>().unwrap())).unwrap();
                })
                .unwrap();
        }
        for i in 0..30i32 {
            bus.send("jobs", i).unwrap();
        }
        let mut per_consumer: [Vec<i32>; 3] = Default::default();
        for (idx, val) in recv_all(&rx, 30) {
            per_consumer[idx].push(val);
        }
        for (idx, got) in per_consumer.iter_mut().enumerate() {
            got.sort_unstable();
            let expect: Vec<i32> = (0..30).filter(|i| *i as usize % 3 == idx).collect();
            assert_eq!(*got, expect, "consumer {idx} share");
        }
        rt.close();
    }

    #[test]
    fn test_publish_fans_out_independent_copies() {
        struct Payload(i32);

        struct PayloadCodec {
            transforms: AtomicUsize,
        }

        impl MessageCodec for PayloadCodec {
            fn name(&self) -> &str {
                "payload"
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
                Ok(Box::new(Payload(0)))
            }

            fn transform(&self, body: &(dyn Any + Send + Sync)) -> Box<dyn Any + Send + Sync> {
                self.transforms.fetch_add(1, Ordering::SeqCst);
                Box::new(Payload(body.downcast_ref::<Payload>().unwrap().0))
            }
        }

        let rt = runtime();
        let bus = rt.event_bus();
        let codec = Arc::new(PayloadCodec {
            transforms: AtomicUsize::new(0),
        });
        bus.register_codec(Arc::clone(&codec) as Arc<dyn MessageCodec>)
            .unwrap();
        let (tx, rx) = mpsc::channel();
        for _ in 0..2 {
            let ctx = rt.event_loop_context();
            let tx = tx.clone();
            let consumer = bus.consumer(&ctx, "topic").unwrap();
            consumer
                .handler(move |msg| {
                    tx.send(msg.body_as::<Payload>().unwrap().0).unwrap();
                })
                .unwrap();
        }
        bus.publish_with(
            "topic",
            Payload(7),
            DeliveryOptions::new().with_codec_name("payload"),
        )
        .unwrap();
        assert_eq!(recv_all(&rx, 2), vec![7, 7]);
        // Each receiver materialized its own copy.
        assert_eq!(codec.transforms.load(Ordering::SeqCst), 2);
        rt.close();
    }

    #[test]
    fn test_request_reply_round_trip() {
        let rt = runtime();
        let bus = rt.event_bus();
        let ctx = rt.event_loop_context();
        let consumer = bus.consumer(&ctx, "echo").unwrap();
        consumer
            .handler(|msg| {
                let body = msg.body_as::<String>().unwrap().clone();
                assert_eq!(body, "ping");
                msg.reply(String::from("pong")).unwrap();
            })
            .unwrap();
        let (tx, rx) = mpsc::channel();
        bus.request(
            &ctx,
            "echo",
            String::from("ping"),
            DeliveryOptions::new(),
            move |res| {
                tx.send(res.map(|m| m.body_as::<String>().unwrap().clone()))
                    .unwrap();
            },
        )
        .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap(),
            "pong"
        );
        rt.close();
    }

    #[test]
    fn test_recipient_failure_reaches_the_reply_handler() {
        let rt = runtime();
        let bus = rt.event_bus();
        let ctx = rt.event_loop_context();
        let consumer = bus.consumer(&ctx, "strict").unwrap();
        consumer
            .handler(|msg| {
                msg.fail(13, "rejected").unwrap();
            })
            .unwrap();
        let (tx, rx) = mpsc::channel();
        bus.request(&ctx, "strict", 1i32, DeliveryOptions::new(), move |res| {
            tx.send(res.err().unwrap()).unwrap();
        })
        .unwrap();
        let err = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(err.kind, ReplyFailure::RecipientFailure);
        assert_eq!(err.code, 13);
        assert_eq!(err.message, "rejected");
        rt.close();
    }

    #[test]
    fn test_request_times_out_without_a_reply() {
        let rt = runtime();
        let bus = rt.event_bus();
        let ctx = rt.event_loop_context();
        let consumer = bus.consumer(&ctx, "silent").unwrap();
        consumer.handler(|_msg| {}).unwrap();
        let (tx, rx) = mpsc::channel();
        bus.request(
            &ctx,
            "silent",
            1i32,
            DeliveryOptions::new().with_timeout(Duration::from_millis(50)),
            move |res| {
                tx.send(res.err().map(|e| e.kind)).unwrap();
            },
        )
        .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Some(ReplyFailure::Timeout)
        );
        rt.close();
    }

    #[test]
    fn test_no_handlers_fails_request_and_publish_is_silent() {
        let rt = runtime();
        let bus = rt.event_bus();
        let ctx = rt.event_loop_context();
        let (tx, rx) = mpsc::channel();
        bus.request(&ctx, "nobody", 1i32, DeliveryOptions::new(), move |res| {
            tx.send(res.err().map(|e| e.kind)).unwrap();
        })
        .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Some(ReplyFailure::NoHandlers)
        );
        // Fire-and-forget send and publish both succeed synchronously.
        bus.send("nobody", 2i32).unwrap();
        bus.publish("nobody", 3i32).unwrap();
        rt.close();
    }

    #[test]
    fn test_send_with_unknown_body_type_fails_synchronously() {
        struct Opaque;
        let rt = runtime();
        let bus = rt.event_bus();
        assert!(matches!(
            bus.send("x", Opaque),
            Err(BusError::NoCodecForType { .. })
        ));
        assert!(matches!(
            bus.send_with("x", 1i32, DeliveryOptions::new().with_codec_name("nope")),
            Err(BusError::UnknownCodec { .. })
        ));
        rt.close();
    }

    #[test]
    fn test_pause_buffers_and_resume_replays_in_order() {
        let rt = runtime();
        let bus = rt.event_bus();
        let ctx = rt.event_loop_context();
        let (tx, rx) = mpsc::channel();
        let consumer = bus.consumer(&ctx, "buffered").unwrap();
        consumer
            .handler(move |msg| {
                tx.send(*msg.body_as::<i32>().unwrap()).unwrap();
            })
            .unwrap();
        consumer.pause();
        for i in 0..5i32 {
            bus.send("buffered", i).unwrap();
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        consumer.resume();
        assert_eq!(recv_all(&rx, 5), vec![0, 1, 2, 3, 4]);
        rt.close();
    }

    #[test]
    fn test_paused_consumer_discards_past_capacity() {
        let rt = runtime();
        let bus = rt.event_bus();
        let ctx = rt.event_loop_context();
        let (tx, rx) = mpsc::channel();
        let (dtx, drx) = mpsc::channel();
        let consumer = bus.consumer(&ctx, "tiny").unwrap();
        consumer
            .handler(move |msg| {
                tx.send(*msg.body_as::<i32>().unwrap()).unwrap();
            })
            .unwrap();
        consumer.discard_handler(move |msg| {
            dtx.send(*msg.body_as::<i32>().unwrap()).unwrap();
        });
        consumer.set_max_buffered(2);
        consumer.pause();
        for i in 0..4i32 {
            bus.send("tiny", i).unwrap();
        }
        // 0 and 1 fit the buffer, 2 and 3 are discarded.
        assert_eq!(recv_all(&drx, 2), vec![2, 3]);
        consumer.resume();
        assert_eq!(recv_all(&rx, 2), vec![0, 1]);
        rt.close();
    }

    #[test]
    fn test_unregistered_consumer_receives_nothing() {
        let rt = runtime();
        let bus = rt.event_bus();
        let ctx = rt.event_loop_context();
        let (tx, rx) = mpsc::channel();
        let consumer = bus.consumer(&ctx, "gone").unwrap();
        consumer
            .handler(move |msg| {
                tx.send(*msg.body_as::<i32>().unwrap()).unwrap();
            })
            .unwrap();
        assert!(consumer.is_registered());
        consumer.unregister();
        assert!(!consumer.is_registered());
        bus.send("gone", 1i32).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        // Terminal state: the handler cannot be re-attached.
        assert!(matches!(
            consumer.handler(|_| {}),
            Err(BusError::NotRegistered)
        ));
        rt.close();
    }

    #[test]
    fn test_completion_handler_reports_registration() {
        let rt = runtime();
        let bus = rt.event_bus();
        let ctx = rt.event_loop_context();
        let consumer = bus.consumer(&ctx, "done").unwrap();
        let (tx, rx) = mpsc::channel();
        consumer.completion_handler(move |res| {
            tx.send(res.is_ok()).unwrap();
        });
        consumer.handler(|_| {}).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        rt.close();
    }

    #[test]
    fn test_interceptor_stamps_headers_and_panics_are_contained() {
        let rt = runtime();
        let bus = rt.event_bus();
        let ctx = rt.event_loop_context();
        bus.add_interceptor(|_dc| panic!("bad interceptor"));
        let id = bus.add_interceptor(|dc| {
            dc.message_mut().headers_mut().set("trace", "abc");
        });
        let (tx, rx) = mpsc::channel();
        let consumer = bus.consumer(&ctx, "traced").unwrap();
        consumer
            .handler(move |msg| {
                tx.send(msg.headers().get("trace").map(str::to_string))
                    .unwrap();
            })
            .unwrap();
        bus.send("traced", 1i32).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap().as_deref(),
            Some("abc")
        );
        assert!(bus.remove_interceptor(id));
        assert!(!bus.remove_interceptor(id));
        bus.send("traced", 2i32).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), None);
        rt.close();
    }

    #[test]
    fn test_producer_backpressure_queues_and_flushes_on_credit() {
        let rt = runtime();
        let bus = rt.event_bus();
        let ctx = rt.event_loop_context();
        let (tx, rx) = mpsc::channel();
        let consumer = bus.consumer(&ctx, "slow").unwrap();
        consumer
            .handler(move |msg| {
                tx.send(msg.body_as::<String>().unwrap().clone()).unwrap();
            })
            .unwrap();
        consumer.pause();

        let producer = bus.sender(&ctx, "slow").unwrap();
        producer.set_write_queue_max_size(2);
        assert!(!producer.write_queue_full());
        producer.write(String::from("a")).unwrap();
        producer.write(String::from("b")).unwrap();
        // Budget of 2 exhausted; the third write queues locally.
        assert!(producer.write_queue_full());
        producer.write(String::from("c")).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // Resuming delivers the buffered messages; each delivery returns one
        // credit, which flushes the queued third write.
        consumer.resume();
        assert_eq!(recv_all(&rx, 3), vec!["a", "b", "c"]);
        let (dtx, drx) = mpsc::channel();
        producer.drain_handler(Box::new(move || {
            dtx.send(()).unwrap();
        }));
        drx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!producer.write_queue_full());
        producer.close();
        rt.close();
    }

    #[test]
    fn test_publisher_producer_broadcasts_without_credits() {
        let rt = runtime();
        let bus = rt.event_bus();
        let ctx = rt.event_loop_context();
        let (tx, rx) = mpsc::channel();
        for _ in 0..2 {
            let tx = tx.clone();
            let consumer = bus.consumer(&ctx, "wide").unwrap();
            consumer
                .handler(move |msg| {
                    tx.send(*msg.body_as::<i64>().unwrap()).unwrap();
                })
                .unwrap();
        }
        let producer = bus.publisher(&ctx, "wide").unwrap();
        assert!(!producer.is_send_mode());
        assert!(!producer.write_queue_full());
        producer.write(9i64).unwrap();
        assert_eq!(recv_all(&rx, 2), vec![9, 9]);
        rt.close();
    }

    #[test]
    fn test_bus_close_unregisters_consumers_and_fires_end_handlers() {
        let rt = runtime();
        let bus = rt.event_bus();
        let ctx = rt.event_loop_context();
        let consumer = bus.consumer(&ctx, "finite").unwrap();
        consumer.handler(|_| {}).unwrap();
        let (tx, rx) = mpsc::channel();
        consumer.end_handler(move || {
            tx.send(()).unwrap();
        });
        bus.close();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!consumer.is_registered());
        assert!(matches!(bus.send("finite", 1i32), Err(BusError::NotStarted)));
        assert!(matches!(
            bus.consumer(&ctx, "finite"),
            Err(BusError::NotStarted)
        ));
        rt.close();
    }

    #[test]
    fn test_reply_and_request_continues_the_conversation() {
        let rt = runtime();
        let bus = rt.event_bus();
        let server_ctx = rt.event_loop_context();
        let client_ctx = rt.event_loop_context();
        let consumer = bus.consumer(&server_ctx, "nego").unwrap();
        {
            let server_ctx = server_ctx.clone();
            consumer
                .handler(move |msg| {
                    msg.reply_and_request(
                        &server_ctx,
                        String::from("offer"),
                        DeliveryOptions::new(),
                        |res| {
                            let answer = res.unwrap();
                            assert_eq!(answer.body_as::<String>().unwrap(), "accept");
                            answer.reply(String::from("sealed")).unwrap();
                        },
                    )
                    .unwrap();
                })
                .unwrap();
        }
        let (tx, rx) = mpsc::channel();
        let reply_ctx = client_ctx.clone();
        bus.request(
            &client_ctx,
            "nego",
            String::from("hello"),
            DeliveryOptions::new(),
            move |res| {
                let offer = res.unwrap();
                assert_eq!(offer.body_as::<String>().unwrap(), "offer");
                offer
                    .reply_and_request(
                        &reply_ctx,
                        String::from("accept"),
                        DeliveryOptions::new(),
                        move |res| {
                            tx.send(res.unwrap().body_as::<String>().unwrap().clone())
                                .unwrap();
                        },
                    )
                    .unwrap();
            },
        )
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "sealed");
        rt.close();
    }
}
