//! Per-destination publish engine.
//!
//! The contract: `publish` never waits on connectivity, buffer space or
//! reconnection, and never fails except under the `Raise` policy or after
//! `close`. The fast path rides a cached channel installed and evicted
//! with CAS; everything that cannot be sent right now goes through a
//! bounded lock-free buffer drained by one background flush task.

use crate::error::{DropReason, Error};
use crate::supervisor::{ConnectionState, Supervisor};
use crate::transport::{MessageChannel, TransportError};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use ringmpmc::OverflowBuffer;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// How the broker acknowledges published messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Publish without waiting for a broker verdict.
    FireAndForget,
    /// Publish and wait for the broker's per-message ack/nack.
    Confirm,
}

/// What happens when the publish buffer is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPolicy {
    /// Evict the oldest buffered payload to make room.
    DropOldest,
    /// Fail the publish call with [`Error::BufferFull`].
    Raise,
    /// Alias of `DropOldest` kept for API compatibility. `publish` never
    /// suspends, so "blocking" resolves to evicting the head.
    Block,
}

pub type ConfirmCallback = Box<dyn Fn(Bytes, &str) + Send + Sync>;
pub type NackCallback = Box<dyn Fn(Bytes, &str) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(Bytes, &str, &Error) + Send + Sync>;
pub type DropCallback = Box<dyn Fn(Bytes, &str, DropReason) + Send + Sync>;

/// Session-acquisition patience of the flush path: fail fast and let the
/// retry accounting handle it rather than stall the whole pass.
const FLUSH_SESSION_ATTEMPTS: u32 = 3;
const FLUSH_SESSION_DELAY: Duration = Duration::from_millis(50);

/// A buffered payload plus its flush-retry count. The counter rides with
/// the entry, so it dies with the message and cannot leak.
struct QueuedMessage {
    payload: Bytes,
    attempts: u32,
}

impl QueuedMessage {
    fn new(payload: Bytes) -> Self {
        Self {
            payload,
            attempts: 0,
        }
    }
}

/// Thin sized wrapper so the channel cache can live in an
/// `ArcSwapOption`; the wrapper's pointer identity is what the CAS
/// install/evict protocol compares.
struct ChannelSlot(Arc<dyn MessageChannel>);

/// Outcome of one send attempt, distinguishing a broker nack (definitive,
/// never retried) from a transport failure (buffered and retried).
enum SendError {
    Transport(TransportError),
    Nacked,
}

/// Availability-first publisher for one destination queue.
///
/// Create with [`Producer::new`], install callbacks before the first
/// publish, then call [`publish`](Self::publish) from any task.
pub struct Producer {
    supervisor: Arc<Supervisor>,
    queue: String,
    mode: PublishMode,
    policy: BufferPolicy,
    buffer: OverflowBuffer<QueuedMessage>,
    /// At most one cached channel at any moment (install/evict via CAS).
    channel: ArcSwapOption<ChannelSlot>,
    closed: AtomicBool,
    // Callback slots: written at most once, before the first publish,
    // then read lock-free on every event.
    confirm_hook: OnceLock<ConfirmCallback>,
    nack_hook: OnceLock<NackCallback>,
    error_hook: OnceLock<ErrorCallback>,
    drop_hook: OnceLock<DropCallback>,
    /// Wake signal for the flush task (ticks come from its own timer; the
    /// supervisor pokes this on reconnect for an out-of-phase pass).
    flush_wake: Arc<Notify>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Producer {
    /// Creates a producer for `queue` and starts its flush task.
    pub fn new(
        supervisor: Arc<Supervisor>,
        queue: impl Into<String>,
        mode: PublishMode,
        policy: BufferPolicy,
    ) -> Arc<Self> {
        let config = supervisor.config().clone();
        let flush_wake = Arc::new(Notify::new());
        supervisor.register_connect_waker(&flush_wake);

        let producer = Arc::new(Self {
            supervisor,
            queue: queue.into(),
            mode,
            policy,
            buffer: OverflowBuffer::new(config.buffer_size),
            channel: ArcSwapOption::empty(),
            closed: AtomicBool::new(false),
            confirm_hook: OnceLock::new(),
            nack_hook: OnceLock::new(),
            error_hook: OnceLock::new(),
            drop_hook: OnceLock::new(),
            flush_wake,
            flush_task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::run_flush(
            Arc::downgrade(&producer),
            config.flush_interval,
        ));
        *producer.flush_task.lock().unwrap() = Some(task);
        producer
    }

    /// Publishes `payload` to this producer's queue.
    ///
    /// Never waits on connectivity, reconnection or buffer space. The only
    /// awaits are the broker write itself and, in `Confirm` mode, that one
    /// channel's confirm window. While disconnected the payload is
    /// buffered and flushed in the background.
    ///
    /// Fails only with [`Error::Closed`] after [`close`](Self::close), or
    /// [`Error::BufferFull`] under the `Raise` policy.
    pub async fn publish(&self, payload: impl Into<Bytes>) -> Result<(), Error> {
        let payload = payload.into();
        if self.closed.load(Ordering::Acquire) {
            self.emit_drop(payload, DropReason::Closed);
            return Err(Error::Closed);
        }

        // Fast path: reuse the cached channel without touching the
        // supervisor. Errors evict the cache and fall through to the
        // buffer; the caller never sees them.
        if let Some(slot) = self.channel.load_full() {
            if slot.0.is_closed() {
                self.evict(&slot);
            } else {
                match self.send_via(&slot.0, &payload).await {
                    Ok(()) => return Ok(()),
                    Err(SendError::Nacked) => {
                        // A nack is a definitive verdict: clear the cache so
                        // a refusing channel is not reused, don't retry.
                        self.evict(&slot);
                        return Ok(());
                    }
                    Err(SendError::Transport(err)) => {
                        self.evict(&slot);
                        if self.mode == PublishMode::Confirm {
                            self.emit_error(payload.clone(), &Error::Transport(err));
                        }
                    }
                }
            }
        }

        self.buffer_payload(payload)
    }

    /// Installs the confirm callback. Effective once; later calls are
    /// ignored.
    pub fn on_confirm(&self, hook: impl Fn(Bytes, &str) + Send + Sync + 'static) {
        let _ = self.confirm_hook.set(Box::new(hook));
    }

    /// Installs the nack callback. Effective once; later calls are ignored.
    pub fn on_nack(&self, hook: impl Fn(Bytes, &str) + Send + Sync + 'static) {
        let _ = self.nack_hook.set(Box::new(hook));
    }

    /// Installs the error callback. Effective once; later calls are
    /// ignored.
    pub fn on_error(&self, hook: impl Fn(Bytes, &str, &Error) + Send + Sync + 'static) {
        let _ = self.error_hook.set(Box::new(hook));
    }

    /// Installs the drop callback. Effective once; later calls are ignored.
    pub fn on_drop(&self, hook: impl Fn(Bytes, &str, DropReason) + Send + Sync + 'static) {
        let _ = self.drop_hook.set(Box::new(hook));
    }

    /// Number of payloads currently buffered.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer capacity.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Monotonic count of payloads evicted from the buffer.
    pub fn dropped(&self) -> u64 {
        self.buffer.dropped()
    }

    /// The destination queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// True once [`close`](Self::close) has begun.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the producer: drains the buffer once (best effort), closes
    /// the cached channel and stops the flush task. Idempotent; after it
    /// returns, no further broker I/O happens on this producer's behalf.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(queue = %self.queue, "closing producer");
        // Stop the flush task first so the final drain cannot race a
        // concurrent pass re-enqueueing failures behind it.
        self.flush_wake.notify_one();
        let task = self.flush_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.final_drain().await;
        if let Some(slot) = self.channel.swap(None) {
            slot.0.close().await;
        }
    }

    // ---------------------------------------------------------------------
    // SEND PATHS
    // ---------------------------------------------------------------------

    /// Publishes on the given channel per this producer's mode, firing the
    /// confirm/nack callbacks that belong to the verdict.
    async fn send_via(
        &self,
        channel: &Arc<dyn MessageChannel>,
        payload: &Bytes,
    ) -> Result<(), SendError> {
        match self.mode {
            PublishMode::FireAndForget => channel
                .publish(&self.queue, payload)
                .await
                .map_err(SendError::Transport),
            PublishMode::Confirm => {
                match channel.publish_confirmed(&self.queue, payload).await {
                    Ok(true) => {
                        self.emit_confirm(payload.clone());
                        Ok(())
                    }
                    Ok(false) => {
                        self.emit_nack(payload.clone());
                        Err(SendError::Nacked)
                    }
                    Err(err) => Err(SendError::Transport(err)),
                }
            }
        }
    }

    /// Routes an unsendable payload into the buffer per the overflow
    /// policy. The decision table:
    ///
    /// | policy              | full buffer            | callback                      |
    /// |---------------------|------------------------|-------------------------------|
    /// | DropOldest / Block  | evict head, enqueue    | `on_drop(evicted, BufferFull)`|
    /// | Raise               | refuse, fail the call  | `on_drop(new, BufferFull)`    |
    fn buffer_payload(&self, payload: Bytes) -> Result<(), Error> {
        match self.policy {
            BufferPolicy::Raise => {
                if self.buffer.is_full() {
                    self.emit_drop(payload, DropReason::BufferFull);
                    return Err(Error::BufferFull);
                }
                match self.buffer.try_push(QueuedMessage::new(payload)) {
                    Ok(()) => Ok(()),
                    Err(message) => {
                        // Lost a fill race between the check and the push.
                        self.emit_drop(message.payload, DropReason::BufferFull);
                        Err(Error::BufferFull)
                    }
                }
            }
            BufferPolicy::DropOldest | BufferPolicy::Block => {
                for evicted in self.buffer.push(QueuedMessage::new(payload)) {
                    self.emit_drop(evicted.payload, DropReason::BufferFull);
                }
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------------
    // FLUSH LOOP
    // ---------------------------------------------------------------------

    async fn run_flush(producer: Weak<Producer>, flush_interval: Duration) {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let wake = match producer.upgrade() {
                Some(p) if !p.is_closed() => Arc::clone(&p.flush_wake),
                _ => return,
            };
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wake.notified() => {}
            }
            let Some(p) = producer.upgrade() else { return };
            if p.is_closed() {
                return;
            }
            p.flush_pass().await;
        }
    }

    /// One drain-and-send pass over the buffer, FIFO. A failed payload is
    /// re-enqueued at the tail (bounded memory beats strict FIFO when the
    /// channel is sick) until its retry budget runs out.
    async fn flush_pass(&self) {
        if self.supervisor.state() != ConnectionState::Connected {
            return;
        }
        if self.buffer.is_empty() {
            return;
        }
        let pending = self.buffer.drain();
        debug!(queue = %self.queue, count = pending.len(), "flushing buffered payloads");
        for message in pending {
            self.flush_one(message).await;
        }
    }

    async fn flush_one(&self, mut message: QueuedMessage) {
        let outcome = match self.acquire_channel().await {
            Ok(slot) => match self.send_via(&slot.0, &message.payload).await {
                Ok(()) => return,
                Err(err) => {
                    // Any failure makes the channel suspect; evict so the
                    // next payload recreates it.
                    self.evict(&slot);
                    err
                }
            },
            Err(err) => {
                debug!(queue = %self.queue, %err, "no channel for flush");
                SendError::Transport(TransportError::ConnectionClosed)
            }
        };

        if matches!(outcome, SendError::Nacked) {
            // on_nack has fired; a nack is definitive, no requeue.
            return;
        }

        message.attempts += 1;
        if message.attempts >= self.supervisor.config().max_flush_retries {
            warn!(
                queue = %self.queue,
                attempts = message.attempts,
                "dropping payload after exhausting flush retries"
            );
            self.emit_drop(message.payload, DropReason::FlushRetryExceeded);
        } else {
            for evicted in self.buffer.push(message) {
                self.emit_drop(evicted.payload, DropReason::BufferFull);
            }
        }
    }

    /// Final best-effort drain run by `close`. Each payload gets the same
    /// bounded retry budget as the flush loop, then drops with
    /// `FlushRetryExceeded`; no `Closed` drops are emitted for payloads
    /// that were accepted at publish time.
    async fn final_drain(&self) {
        let pending = self.buffer.drain();
        if pending.is_empty() {
            return;
        }
        debug!(queue = %self.queue, count = pending.len(), "draining buffer before close");
        let budget = self.supervisor.config().max_flush_retries;
        for mut message in pending {
            loop {
                let sent = match self.acquire_channel().await {
                    Ok(slot) => match self.send_via(&slot.0, &message.payload).await {
                        Ok(()) | Err(SendError::Nacked) => true,
                        Err(SendError::Transport(_)) => {
                            self.evict(&slot);
                            false
                        }
                    },
                    Err(_) => false,
                };
                if sent {
                    break;
                }
                message.attempts += 1;
                if message.attempts >= budget {
                    self.emit_drop(message.payload, DropReason::FlushRetryExceeded);
                    break;
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // CHANNEL CACHE
    // ---------------------------------------------------------------------

    /// Returns the cached channel, creating and installing one if the
    /// cache is empty or stale. Lock-free: losers of the install race
    /// close their redundant channel and adopt the winner's, so at most
    /// one durable channel ever exists per producer.
    async fn acquire_channel(&self) -> Result<Arc<ChannelSlot>, Error> {
        if let Some(slot) = self.channel.load_full() {
            if !slot.0.is_closed() {
                return Ok(slot);
            }
            self.evict(&slot);
        }

        let session = self
            .supervisor
            .session_with_retry(FLUSH_SESSION_ATTEMPTS, FLUSH_SESSION_DELAY)
            .await?;
        let fresh = session.open_channel().await?;
        let slot = Arc::new(ChannelSlot(fresh));

        let previous = self
            .channel
            .compare_and_swap(ptr::null::<ChannelSlot>(), Some(Arc::clone(&slot)));
        match &*previous {
            None => Ok(slot),
            Some(winner) => {
                let winner = Arc::clone(winner);
                slot.0.close().await;
                Ok(winner)
            }
        }
    }

    /// Evicts `slot` from the cache iff it is still the cached value, so
    /// two racing evictions (or an eviction racing a fresh install) cannot
    /// clobber a newer channel.
    fn evict(&self, slot: &Arc<ChannelSlot>) {
        self.channel.compare_and_swap(slot, None);
    }

    // ---------------------------------------------------------------------
    // CALLBACK FAN-OUT
    // ---------------------------------------------------------------------

    fn emit_confirm(&self, payload: Bytes) {
        if let Some(hook) = self.confirm_hook.get() {
            hook(payload, &self.queue);
        }
    }

    fn emit_nack(&self, payload: Bytes) {
        if let Some(hook) = self.nack_hook.get() {
            hook(payload, &self.queue);
        }
    }

    fn emit_error(&self, payload: Bytes, error: &Error) {
        if let Some(hook) = self.error_hook.get() {
            hook(payload, &self.queue, error);
        }
    }

    fn emit_drop(&self, payload: Bytes, reason: DropReason) {
        debug!(queue = %self.queue, %reason, "dropping payload");
        if let Some(hook) = self.drop_hook.get() {
            hook(payload, &self.queue, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::MemoryTransport;
    use std::sync::Mutex as StdMutex;

    async fn connected_producer(
        transport: &MemoryTransport,
        config: Config,
        mode: PublishMode,
        policy: BufferPolicy,
    ) -> (Arc<Supervisor>, Arc<Producer>) {
        let supervisor = Supervisor::connect(Arc::new(transport.clone()), config)
            .await
            .unwrap();
        let producer = Producer::new(Arc::clone(&supervisor), "orders", mode, policy);
        (supervisor, producer)
    }

    fn fast_flush() -> Config {
        Config::default().with_flush_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_first_publish_buffers_then_flush_installs_channel() {
        let transport = MemoryTransport::new();
        let (supervisor, producer) = connected_producer(
            &transport,
            fast_flush(),
            PublishMode::FireAndForget,
            BufferPolicy::DropOldest,
        )
        .await;

        // No cached channel yet, so the first publishes take the buffer.
        producer.publish(&b"hello"[..]).await.unwrap();
        producer.publish(&b"world"[..]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.queued("orders").len(), 2);
        assert_eq!(producer.buffer_len(), 0);

        // The flush pass installed the channel; now the fast path carries
        // publishes straight to the broker.
        producer.publish(&b"again"[..]).await.unwrap();
        assert_eq!(transport.queued("orders").len(), 3);
        assert_eq!(producer.buffer_len(), 0);

        producer.close().await;
        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_drop_oldest_when_disconnected() {
        let transport = MemoryTransport::new();
        let config = Config::default().with_buffer_size(2);
        let (supervisor, producer) = connected_producer(
            &transport,
            config,
            PublishMode::FireAndForget,
            BufferPolicy::DropOldest,
        )
        .await;

        let drops = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&drops);
        producer.on_drop(move |payload, queue, reason| {
            seen.lock().unwrap().push((payload, queue.to_string(), reason));
        });

        // Take the broker away so everything buffers.
        transport.refuse_connects(true);
        transport.kill_connections();
        tokio::time::sleep(Duration::from_millis(20)).await;

        producer.publish(&b"m1"[..]).await.unwrap();
        producer.publish(&b"m2"[..]).await.unwrap();
        producer.publish(&b"m3"[..]).await.unwrap();

        let drops = drops.lock().unwrap().clone();
        assert_eq!(drops.len(), 1);
        assert_eq!(&drops[0].0[..], b"m1");
        assert_eq!(drops[0].1, "orders");
        assert_eq!(drops[0].2, DropReason::BufferFull);
        assert_eq!(producer.buffer_len(), 2);
        assert_eq!(producer.dropped(), 1);

        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_raise_policy_fails_publish() {
        let transport = MemoryTransport::new();
        let config = Config::default().with_buffer_size(1);
        let (supervisor, producer) = connected_producer(
            &transport,
            config,
            PublishMode::Confirm,
            BufferPolicy::Raise,
        )
        .await;

        let drops = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&drops);
        producer.on_drop(move |payload, _queue, reason| {
            seen.lock().unwrap().push((payload, reason));
        });

        transport.refuse_connects(true);
        transport.kill_connections();
        tokio::time::sleep(Duration::from_millis(20)).await;

        producer.publish(&b"m1"[..]).await.unwrap();
        let result = producer.publish(&b"m2"[..]).await;
        assert!(matches!(result, Err(Error::BufferFull)));

        let drops = drops.lock().unwrap().clone();
        assert_eq!(drops.len(), 1);
        assert_eq!(&drops[0].0[..], b"m2");
        assert_eq!(drops[0].1, DropReason::BufferFull);
        assert_eq!(producer.buffer_len(), 1);

        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let transport = MemoryTransport::new();
        let (supervisor, producer) = connected_producer(
            &transport,
            Config::default(),
            PublishMode::FireAndForget,
            BufferPolicy::DropOldest,
        )
        .await;

        let drops = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&drops);
        producer.on_drop(move |payload, _queue, reason| {
            seen.lock().unwrap().push((payload, reason));
        });

        producer.close().await;
        let result = producer.publish(&b"late"[..]).await;
        assert!(matches!(result, Err(Error::Closed)));

        let drops = drops.lock().unwrap().clone();
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].1, DropReason::Closed);

        producer.close().await; // idempotent
        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_confirm_mode_fires_on_confirm() {
        let transport = MemoryTransport::new();
        let (supervisor, producer) = connected_producer(
            &transport,
            fast_flush(),
            PublishMode::Confirm,
            BufferPolicy::DropOldest,
        )
        .await;

        let confirms = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&confirms);
        producer.on_confirm(move |payload, _queue| {
            seen.lock().unwrap().push(payload);
        });

        producer.publish(&b"sure"[..]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(confirms.lock().unwrap().len(), 1);

        producer.close().await;
        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_nacked_payload_is_not_retried() {
        let transport = MemoryTransport::new();
        let (supervisor, producer) = connected_producer(
            &transport,
            fast_flush(),
            PublishMode::Confirm,
            BufferPolicy::DropOldest,
        )
        .await;

        let nacks = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&nacks);
        producer.on_nack(move |payload, _queue| {
            seen.lock().unwrap().push(payload);
        });

        transport.nack_publishes(true);
        producer.publish(&b"refused"[..]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(nacks.lock().unwrap().len(), 1);
        assert_eq!(producer.buffer_len(), 0);

        producer.close().await;
        supervisor.close().await;
    }
}
