//! In-memory broker doubles for tests and benchmarks.
//!
//! [`MemoryTransport`] is a controllable broker: it stores published
//! payloads per queue, feeds live subscribers with per-channel delivery
//! tags, and exposes fault switches (`kill_connections`,
//! `refuse_connects`, `fail_publishes`, `nack_publishes`) to script
//! outage scenarios. [`NullTransport`] discards everything and is meant
//! for throughput measurements.

use crate::transport::{
    CloseReason, Delivery, MessageChannel, Session, Transport, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};

const DELIVERY_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// MEMORY BROKER
// =============================================================================

struct Subscriber {
    queue: String,
    consumer_tag: String,
    tx: mpsc::Sender<Delivery>,
    channel: Weak<ChannelCore>,
}

impl Subscriber {
    fn is_live(&self) -> bool {
        !self.tx.is_closed()
            && self
                .channel
                .upgrade()
                .is_some_and(|core| !core.closed.load(Ordering::Acquire))
    }
}

#[derive(Default)]
struct BrokerCore {
    connects: AtomicU64,
    publishes: AtomicU64,
    declares: AtomicU64,
    refuse_connects: AtomicBool,
    fail_publishes: AtomicBool,
    nack_publishes: AtomicBool,
    /// Published payloads with no live subscriber, per queue.
    stored: Mutex<HashMap<String, VecDeque<Bytes>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    sessions: Mutex<Vec<Weak<MemorySession>>>,
    acks: Mutex<Vec<(u64, bool)>>,
    nacks: Mutex<Vec<(u64, bool, bool)>>,
}

impl BrokerCore {
    /// Routes a publish to a live subscriber, or stores it.
    async fn route(&self, queue: &str, payload: Bytes) {
        // Pick a live subscriber and assign the tag while holding the
        // lock, but send after releasing it.
        let target = {
            let mut subscribers = self.subscribers.lock().unwrap();
            subscribers.retain(Subscriber::is_live);
            subscribers
                .iter()
                .find(|s| s.queue == queue)
                .and_then(|s| {
                    s.channel.upgrade().map(|core| {
                        (s.tx.clone(), core.next_tag.fetch_add(1, Ordering::Relaxed) + 1)
                    })
                })
        };

        match target {
            Some((tx, delivery_tag)) => {
                let delivery = Delivery {
                    queue: queue.to_string(),
                    delivery_tag,
                    payload: payload.clone(),
                    redelivered: false,
                };
                if tx.send(delivery).await.is_err() {
                    self.store(queue, payload);
                }
            }
            None => self.store(queue, payload),
        }
    }

    fn store(&self, queue: &str, payload: Bytes) {
        self.stored
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
    }
}

/// Controllable in-memory broker.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<BrokerCore>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u64 {
        self.broker.connects.load(Ordering::Relaxed)
    }

    /// Number of publish operations that reached the broker.
    pub fn publish_count(&self) -> u64 {
        self.broker.publishes.load(Ordering::Relaxed)
    }

    /// Number of queue declarations seen by the broker. Channels declare
    /// lazily, so this counts one per (channel, queue) pair, not one per
    /// publish.
    pub fn declare_count(&self) -> u64 {
        self.broker.declares.load(Ordering::Relaxed)
    }

    /// Makes every subsequent connect attempt fail.
    pub fn refuse_connects(&self, refuse: bool) {
        self.broker.refuse_connects.store(refuse, Ordering::Release);
    }

    /// Makes every subsequent publish fail with an I/O error.
    pub fn fail_publishes(&self, fail: bool) {
        self.broker.fail_publishes.store(fail, Ordering::Release);
    }

    /// Makes every subsequent confirmed publish come back nacked.
    pub fn nack_publishes(&self, nack: bool) {
        self.broker.nack_publishes.store(nack, Ordering::Release);
    }

    /// Tears down every live session, firing their close notifications.
    /// This is the broker-side connection loss.
    pub fn kill_connections(&self) {
        let sessions: Vec<_> = {
            let mut sessions = self.broker.sessions.lock().unwrap();
            sessions.retain(|weak| weak.strong_count() > 0);
            sessions.iter().filter_map(Weak::upgrade).collect()
        };
        for session in sessions {
            session.force_close(CloseReason {
                code: 320,
                text: "CONNECTION_FORCED - broker shut down".into(),
            });
        }
    }

    /// Snapshot of the payloads stored for `queue` (published with no
    /// live subscriber).
    pub fn queued(&self, queue: &str) -> Vec<Bytes> {
        self.broker
            .stored
            .lock()
            .unwrap()
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live subscriptions on `queue`.
    pub fn subscriber_count(&self, queue: &str) -> usize {
        let mut subscribers = self.broker.subscribers.lock().unwrap();
        subscribers.retain(Subscriber::is_live);
        subscribers.iter().filter(|s| s.queue == queue).count()
    }

    /// Acks seen by the broker, as `(delivery_tag, multiple)`.
    pub fn acks(&self) -> Vec<(u64, bool)> {
        self.broker.acks.lock().unwrap().clone()
    }

    /// Nacks seen by the broker, as `(delivery_tag, multiple, requeue)`.
    pub fn nacks(&self) -> Vec<(u64, bool, bool)> {
        self.broker.nacks.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Arc<dyn Session>, TransportError> {
        if self.broker.refuse_connects.load(Ordering::Acquire) {
            return Err(TransportError::Connect("connection refused".into()));
        }
        self.broker.connects.fetch_add(1, Ordering::Relaxed);
        let (closed_tx, _) = watch::channel(None);
        let session = Arc::new(MemorySession {
            broker: Arc::clone(&self.broker),
            closed: AtomicBool::new(false),
            closed_tx,
            channels: Mutex::new(Vec::new()),
        });
        self.broker
            .sessions
            .lock()
            .unwrap()
            .push(Arc::downgrade(&session));
        Ok(session)
    }
}

struct MemorySession {
    broker: Arc<BrokerCore>,
    closed: AtomicBool,
    closed_tx: watch::Sender<Option<CloseReason>>,
    channels: Mutex<Vec<Weak<ChannelCore>>>,
}

impl MemorySession {
    fn force_close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for channel in self.channels.lock().unwrap().iter() {
            if let Some(core) = channel.upgrade() {
                core.closed.store(true, Ordering::Release);
            }
        }
        let _ = self.closed_tx.send(Some(reason));
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn open_channel(&self) -> Result<Arc<dyn MessageChannel>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        let core = Arc::new(ChannelCore {
            closed: AtomicBool::new(false),
            next_tag: AtomicU64::new(0),
        });
        self.channels.lock().unwrap().push(Arc::downgrade(&core));
        Ok(Arc::new(MemoryChannel {
            broker: Arc::clone(&self.broker),
            core,
            declared: Mutex::new(HashSet::new()),
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn closed(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed_tx.subscribe()
    }

    async fn close(&self) {
        self.force_close(CloseReason {
            code: 200,
            text: "client closed".into(),
        });
    }
}

struct ChannelCore {
    closed: AtomicBool,
    next_tag: AtomicU64,
}

struct MemoryChannel {
    broker: Arc<BrokerCore>,
    core: Arc<ChannelCore>,
    /// Queues already declared on this channel; mirrors the real
    /// transport's lazy per-channel declaration.
    declared: Mutex<HashSet<String>>,
}

impl MemoryChannel {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.core.closed.load(Ordering::Acquire) {
            Err(TransportError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    fn ensure_queue(&self, queue: &str) {
        let mut declared = self.declared.lock().unwrap();
        if declared.insert(queue.to_string()) {
            self.broker.declares.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.check_open()?;
        self.ensure_queue(queue);
        if self.broker.fail_publishes.load(Ordering::Acquire) {
            return Err(TransportError::Io("injected publish failure".into()));
        }
        self.broker.publishes.fetch_add(1, Ordering::Relaxed);
        self.broker
            .route(queue, Bytes::copy_from_slice(payload))
            .await;
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        queue: &str,
        payload: &[u8],
    ) -> Result<bool, TransportError> {
        self.check_open()?;
        self.ensure_queue(queue);
        if self.broker.fail_publishes.load(Ordering::Acquire) {
            return Err(TransportError::Io("injected publish failure".into()));
        }
        self.broker.publishes.fetch_add(1, Ordering::Relaxed);
        if self.broker.nack_publishes.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.broker
            .route(queue, Bytes::copy_from_slice(payload))
            .await;
        Ok(true)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _no_ack: bool,
        _prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError> {
        self.check_open()?;
        self.ensure_queue(queue);
        let (tx, rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);

        // Replay what accumulated while nobody was subscribed.
        let backlog: Vec<Bytes> = self
            .broker
            .stored
            .lock()
            .unwrap()
            .get_mut(queue)
            .map(std::mem::take)
            .unwrap_or_default()
            .into();
        for payload in backlog {
            let delivery = Delivery {
                queue: queue.to_string(),
                delivery_tag: self.core.next_tag.fetch_add(1, Ordering::Relaxed) + 1,
                payload,
                redelivered: false,
            };
            let _ = tx.send(delivery).await;
        }

        self.broker.subscribers.lock().unwrap().push(Subscriber {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            tx,
            channel: Arc::downgrade(&self.core),
        });
        Ok(rx)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.broker
            .subscribers
            .lock()
            .unwrap()
            .retain(|s| s.consumer_tag != consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError> {
        self.check_open()?;
        self.broker.acks.lock().unwrap().push((delivery_tag, multiple));
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        self.broker
            .nacks
            .lock()
            .unwrap()
            .push((delivery_tag, multiple, requeue));
        Ok(())
    }

    async fn close(&self) {
        self.core.closed.store(true, Ordering::Release);
    }
}

// =============================================================================
// NULL TRANSPORT (for benchmarks)
// =============================================================================

/// Transport that accepts everything and delivers nothing.
#[derive(Clone, Copy, Default)]
pub struct NullTransport;

impl NullTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for NullTransport {
    async fn connect(&self) -> Result<Arc<dyn Session>, TransportError> {
        let (closed_tx, _) = watch::channel(None);
        Ok(Arc::new(NullSession { closed_tx }))
    }
}

struct NullSession {
    closed_tx: watch::Sender<Option<CloseReason>>,
}

#[async_trait]
impl Session for NullSession {
    async fn open_channel(&self) -> Result<Arc<dyn MessageChannel>, TransportError> {
        Ok(Arc::new(NullChannel {
            consume_senders: Mutex::new(Vec::new()),
        }))
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn closed(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed_tx.subscribe()
    }

    async fn close(&self) {}
}

struct NullChannel {
    /// Keeps delivery senders alive so consume streams stay open.
    consume_senders: Mutex<Vec<mpsc::Sender<Delivery>>>,
}

#[async_trait]
impl MessageChannel for NullChannel {
    fn is_closed(&self) -> bool {
        false
    }

    async fn publish(&self, _queue: &str, _payload: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        _queue: &str,
        _payload: &[u8],
    ) -> Result<bool, TransportError> {
        Ok(true)
    }

    async fn consume(
        &self,
        _queue: &str,
        _consumer_tag: &str,
        _no_ack: bool,
        _prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError> {
        let (tx, rx) = mpsc::channel(1);
        self.consume_senders.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn cancel(&self, _consumer_tag: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn ack(&self, _delivery_tag: u64, _multiple: bool) -> Result<(), TransportError> {
        Ok(())
    }

    async fn nack(
        &self,
        _delivery_tag: u64,
        _multiple: bool,
        _requeue: bool,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stores_without_subscriber_and_replays_on_consume() {
        let transport = MemoryTransport::new();
        let session = transport.connect().await.unwrap();
        let channel = session.open_channel().await.unwrap();

        channel.publish("q", b"one").await.unwrap();
        channel.publish("q", b"two").await.unwrap();
        assert_eq!(transport.queued("q").len(), 2);

        let mut rx = channel.consume("q", "tag-1", false, 10).await.unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(&first.payload[..], b"one");
        assert_eq!(first.delivery_tag, 1);
        assert_eq!(second.delivery_tag, 2);
        assert!(transport.queued("q").is_empty());

        // Live delivery now that a subscriber exists.
        channel.publish("q", b"three").await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(third.delivery_tag, 3);
    }

    #[tokio::test]
    async fn test_kill_connections_fires_close_notification() {
        let transport = MemoryTransport::new();
        let session = transport.connect().await.unwrap();
        let mut closed = session.closed();
        assert!(closed.borrow().is_none());

        transport.kill_connections();
        closed.changed().await.unwrap();
        let reason = closed.borrow().clone().unwrap();
        assert_eq!(reason.code, 320);
        assert!(session.is_closed());

        // Channels of a killed session refuse further work.
        assert!(matches!(
            session.open_channel().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_declares_once_per_channel_not_per_publish() {
        let transport = MemoryTransport::new();
        let session = transport.connect().await.unwrap();

        let first = session.open_channel().await.unwrap();
        first.publish("q", b"one").await.unwrap();
        first.publish("q", b"two").await.unwrap();
        first.publish("other", b"three").await.unwrap();
        assert_eq!(transport.declare_count(), 2);

        // A fresh channel carries its own declaration cache.
        let second = session.open_channel().await.unwrap();
        second.publish("q", b"four").await.unwrap();
        assert_eq!(transport.declare_count(), 3);

        // Consuming declares the destination too.
        let _rx = second.consume("inbox", "tag-1", false, 10).await.unwrap();
        assert_eq!(transport.declare_count(), 4);
    }

    #[tokio::test]
    async fn test_injected_publish_failures() {
        let transport = MemoryTransport::new();
        let session = transport.connect().await.unwrap();
        let channel = session.open_channel().await.unwrap();

        transport.fail_publishes(true);
        assert!(channel.publish("q", b"x").await.is_err());

        transport.fail_publishes(false);
        transport.nack_publishes(true);
        assert_eq!(channel.publish_confirmed("q", b"x").await.unwrap(), false);

        transport.nack_publishes(false);
        assert_eq!(channel.publish_confirmed("q", b"x").await.unwrap(), true);
    }
}
