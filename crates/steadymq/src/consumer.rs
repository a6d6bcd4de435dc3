//! Per-destination subscription engine.
//!
//! One consumer owns one dedicated channel per subscription, so ack
//! streams never interleave across queues. On every reconnect the
//! supervisor calls [`Consumer::resubscribe`], which drops the stale
//! channel and re-runs the subscribe sequence from scratch.

use crate::ack::AckTracker;
use crate::error::Error;
use crate::supervisor::Supervisor;
use crate::transport::{Delivery, MessageChannel};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type DeliveryHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Subscriber for one destination queue.
pub struct Consumer {
    supervisor: Arc<Supervisor>,
    queue: String,
    prefetch: u16,
    /// Set once by `subscribe`; re-read by every resubscribe.
    handler: OnceLock<DeliveryHandler>,
    no_ack: AtomicBool,
    subscribed: AtomicBool,
    // Shared with the dispatch task, which outlives any one borrow of
    // the consumer.
    closed: Arc<AtomicBool>,
    channel: Mutex<Option<Arc<dyn MessageChannel>>>,
    consumer_tag: Mutex<Option<String>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    ack_tracker: Arc<AckTracker>,
}

impl Consumer {
    /// Creates a consumer for `queue` and registers it for the
    /// supervisor's post-reconnect resubscribe fan-out.
    pub fn new(supervisor: Arc<Supervisor>, queue: impl Into<String>) -> Arc<Self> {
        let prefetch = supervisor.config().prefetch;
        let consumer = Arc::new(Self {
            supervisor,
            queue: queue.into(),
            prefetch,
            handler: OnceLock::new(),
            no_ack: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            channel: Mutex::new(None),
            consumer_tag: Mutex::new(None),
            dispatch_task: Mutex::new(None),
            ack_tracker: Arc::new(AckTracker::new()),
        });
        consumer.supervisor.register_consumer(&consumer);
        consumer
    }

    /// Subscribes with `handler`. With `no_ack` the broker considers every
    /// delivery settled on send and nothing is tracked.
    ///
    /// A failure here leaves no channel behind; the next reconnect retries
    /// the subscription cleanly.
    pub async fn subscribe(
        &self,
        no_ack: bool,
        handler: impl Fn(Delivery) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if self.handler.set(Arc::new(handler)).is_err() {
            warn!(queue = %self.queue, "subscribe called twice, keeping the original handler");
        }
        self.no_ack.store(no_ack, Ordering::Release);
        self.subscribed.store(true, Ordering::Release);
        self.do_subscribe().await
    }

    /// Re-runs the subscription on the current session. Idempotent: safe
    /// to call on every reconnect, before `subscribe`, or after `close`
    /// (the latter two are no-ops).
    ///
    /// The ack tracker is intentionally not cleared: the fresh channel
    /// numbers tags from 1 again, and residual tags from the dead channel
    /// are inert. Call [`ack_tracker`](Self::ack_tracker)`.clear()` to
    /// shed them.
    pub async fn resubscribe(&self) {
        if self.closed.load(Ordering::Acquire) || !self.subscribed.load(Ordering::Acquire) {
            return;
        }
        self.abandon_channel();
        match self.do_subscribe().await {
            Ok(()) => info!(queue = %self.queue, "resubscribed"),
            Err(err) => {
                // Leave everything unset; the next reconnect retries.
                warn!(queue = %self.queue, %err, "resubscribe failed");
            }
        }
    }

    /// Acknowledges a delivery. Best-effort under reconnect: failures are
    /// logged, never propagated.
    pub async fn ack(&self, delivery_tag: u64, multiple: bool) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let channel = self.current_channel();
        if let Some(channel) = channel {
            if let Err(err) = channel.ack(delivery_tag, multiple).await {
                warn!(queue = %self.queue, delivery_tag, %err, "ack failed");
            }
        }
        self.ack_tracker.ack(delivery_tag, multiple);
    }

    /// Rejects a delivery, optionally asking the broker to requeue it.
    /// Best-effort under reconnect: failures are logged, never propagated.
    pub async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let channel = self.current_channel();
        if let Some(channel) = channel {
            if let Err(err) = channel.nack(delivery_tag, multiple, requeue).await {
                warn!(queue = %self.queue, delivery_tag, %err, "nack failed");
            }
        }
        self.ack_tracker.nack(delivery_tag, multiple);
    }

    /// Outstanding-delivery bookkeeping for this consumer.
    pub fn ack_tracker(&self) -> &AckTracker {
        &self.ack_tracker
    }

    /// The subscribed queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// True once [`close`](Self::close) has begun.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cancels the subscription and closes the dedicated channel.
    /// Subsequent operations are silent no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(queue = %self.queue, "closing consumer");
        if let Some(task) = self.dispatch_task.lock().unwrap().take() {
            task.abort();
        }
        let tag = self.consumer_tag.lock().unwrap().take();
        let channel = self.channel.lock().unwrap().take();
        if let Some(channel) = channel {
            if let Some(tag) = tag {
                if let Err(err) = channel.cancel(&tag).await {
                    debug!(queue = %self.queue, %err, "consume cancel failed");
                }
            }
            channel.close().await;
        }
        self.ack_tracker.clear();
    }

    // ---------------------------------------------------------------------
    // SUBSCRIPTION MACHINERY
    // ---------------------------------------------------------------------

    /// Opens a dedicated channel, applies prefetch, starts the consume and
    /// installs the dispatch task. On any failure the channel and
    /// consumer-tag stay unset so a later attempt starts clean.
    async fn do_subscribe(&self) -> Result<(), Error> {
        let handler = self
            .handler
            .get()
            .cloned()
            .ok_or_else(|| Error::Config("no delivery handler installed".into()))?;
        let no_ack = self.no_ack.load(Ordering::Acquire);

        let session = self.supervisor.session().await?;
        let channel = session.open_channel().await?;
        let tag = format!(
            "consumer-{}-{:08x}",
            self.queue,
            rand::thread_rng().gen::<u32>()
        );
        let mut deliveries = channel
            .consume(&self.queue, &tag, no_ack, self.prefetch)
            .await?;

        let tracker = Arc::clone(&self.ack_tracker);
        let closed = Arc::clone(&self.closed);
        let dispatch = tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                if closed.load(Ordering::Acquire) {
                    return;
                }
                if !no_ack {
                    tracker.track(delivery.delivery_tag);
                }
                handler(delivery);
            }
        });

        *self.channel.lock().unwrap() = Some(channel);
        *self.consumer_tag.lock().unwrap() = Some(tag);
        let previous = self.dispatch_task.lock().unwrap().replace(dispatch);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Drops the stale channel reference and stops its dispatch task. The
    /// broker abandons open deliveries on the old channel by itself.
    fn abandon_channel(&self) {
        if let Some(task) = self.dispatch_task.lock().unwrap().take() {
            task.abort();
        }
        self.channel.lock().unwrap().take();
        self.consumer_tag.lock().unwrap().take();
    }

    fn current_channel(&self) -> Option<Arc<dyn MessageChannel>> {
        self.channel.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::producer::{BufferPolicy, Producer, PublishMode};
    use crate::testing::MemoryTransport;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    async fn setup(transport: &MemoryTransport) -> Arc<Supervisor> {
        Supervisor::connect(
            Arc::new(transport.clone()),
            Config::default()
                .with_reconnect_backoff(
                    Duration::from_millis(10),
                    Duration::from_millis(50),
                    2.0,
                )
                .with_health_check_interval(Duration::from_millis(20))
                .with_flush_interval(Duration::from_millis(10)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_delivers_to_handler_and_tracks_tags() {
        let transport = MemoryTransport::new();
        let supervisor = setup(&transport).await;

        let consumer = Consumer::new(Arc::clone(&supervisor), "jobs");
        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        consumer
            .subscribe(false, move |delivery| {
                sink.lock().unwrap().push(delivery);
            })
            .await
            .unwrap();

        let producer = Producer::new(
            Arc::clone(&supervisor),
            "jobs",
            PublishMode::FireAndForget,
            BufferPolicy::DropOldest,
        );
        producer.publish(&b"job-1"[..]).await.unwrap();
        producer.publish(&b"job-2"[..]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        {
            let received = received.lock().unwrap();
            assert_eq!(received.len(), 2);
            assert_eq!(&received[0].payload[..], b"job-1");
            assert_eq!(received[0].delivery_tag, 1);
            assert_eq!(received[1].delivery_tag, 2);
        }
        assert_eq!(consumer.ack_tracker().count(), 2);

        consumer.ack(2, true).await;
        assert_eq!(consumer.ack_tracker().count(), 0);

        producer.close().await;
        consumer.close().await;
        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_no_ack_skips_tracking() {
        let transport = MemoryTransport::new();
        let supervisor = setup(&transport).await;

        let consumer = Consumer::new(Arc::clone(&supervisor), "events");
        let received = Arc::new(StdMutex::new(0usize));
        let sink = Arc::clone(&received);
        consumer
            .subscribe(true, move |_delivery| {
                *sink.lock().unwrap() += 1;
            })
            .await
            .unwrap();

        let producer = Producer::new(
            Arc::clone(&supervisor),
            "events",
            PublishMode::FireAndForget,
            BufferPolicy::DropOldest,
        );
        producer.publish(&b"tick"[..]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*received.lock().unwrap(), 1);
        assert_eq!(consumer.ack_tracker().count(), 0);

        producer.close().await;
        consumer.close().await;
        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_resubscribes_after_reconnect() {
        let transport = MemoryTransport::new();
        let supervisor = setup(&transport).await;

        let consumer = Consumer::new(Arc::clone(&supervisor), "jobs");
        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        consumer
            .subscribe(false, move |delivery| {
                sink.lock().unwrap().push(delivery);
            })
            .await
            .unwrap();
        assert_eq!(transport.subscriber_count("jobs"), 1);

        let mut states = supervisor.subscribe_state();
        transport.kill_connections();
        loop {
            if *states.borrow_and_update() == crate::supervisor::ConnectionState::Connected
                && transport.connect_count() >= 2
            {
                break;
            }
            states.changed().await.unwrap();
        }
        // Give the concurrent resubscribe fan-out a beat to finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.subscriber_count("jobs"), 1);

        // Deliveries flow again on the fresh channel, tags start over.
        let producer = Producer::new(
            Arc::clone(&supervisor),
            "jobs",
            PublishMode::FireAndForget,
            BufferPolicy::DropOldest,
        );
        producer.publish(&b"after"[..]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].delivery_tag, 1);

        drop(received);
        producer.close().await;
        consumer.close().await;
        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_close_makes_operations_noops() {
        let transport = MemoryTransport::new();
        let supervisor = setup(&transport).await;

        let consumer = Consumer::new(Arc::clone(&supervisor), "jobs");
        consumer.subscribe(false, |_| {}).await.unwrap();
        consumer.close().await;
        consumer.close().await;

        consumer.ack(1, false).await;
        consumer.nack(2, false, true).await;
        assert_eq!(consumer.ack_tracker().count(), 0);
        assert_eq!(transport.subscriber_count("jobs"), 0);

        supervisor.close().await;
    }
}
