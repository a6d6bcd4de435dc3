//! The opaque broker boundary.
//!
//! The supervisor, producers and consumers only ever talk to the broker
//! through these object-safe traits. The production implementation lives
//! in [`crate::amqp`]; [`crate::testing`] provides an in-memory broker for
//! tests and benchmarks.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Errors crossing the broker boundary.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Could not establish a session.
    #[error("connect failed: {0}")]
    Connect(String),

    /// I/O failure on an established session or channel.
    #[error("broker i/o error: {0}")]
    Io(String),

    /// The destination queue could not be declared or resolved.
    #[error("destination not available: {0}")]
    NotFound(String),

    /// The channel is closed and cannot carry further operations.
    #[error("channel is closed")]
    ChannelClosed,

    /// The connection is closed and cannot open channels.
    #[error("connection is closed")]
    ConnectionClosed,
}

impl TransportError {
    /// Returns `true` if the session or channel that produced this error
    /// is dead and must be replaced before retrying.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::ConnectionClosed)
    }

    /// Returns `true` if retrying the same operation on the same handle
    /// may succeed (transient I/O, a refused connect, a declare race).
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        !self.is_terminal()
    }
}

/// Why the broker (or the network) tore down a session.
#[derive(Debug, Clone)]
pub struct CloseReason {
    /// AMQP reply code, 0 when unknown.
    pub code: u16,
    /// Human-readable close text.
    pub text: String,
}

/// One message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue the message was consumed from.
    pub queue: String,
    /// Channel-scoped monotonic delivery tag.
    pub delivery_tag: u64,
    /// Opaque message body.
    pub payload: Bytes,
    /// True when the broker re-delivered after an earlier attempt.
    pub redelivered: bool,
}

/// A way to establish broker sessions. Implementations are cheap handles;
/// each `connect` yields an independent session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new authenticated session.
    async fn connect(&self) -> Result<Arc<dyn Session>, TransportError>;
}

/// One authenticated connection to the broker.
#[async_trait]
pub trait Session: Send + Sync {
    /// Opens a multiplexed channel on this session.
    async fn open_channel(&self) -> Result<Arc<dyn MessageChannel>, TransportError>;

    /// True once the session has been torn down, locally or by the broker.
    fn is_closed(&self) -> bool;

    /// Asynchronous close notification. The receiver observes `Some`
    /// exactly when the session dies; a watch channel is used so late
    /// subscribers still see a loss that already happened.
    fn closed(&self) -> watch::Receiver<Option<CloseReason>>;

    /// Tears the session down. Idempotent.
    async fn close(&self);
}

/// One channel within a session: independent confirm and ack state.
///
/// Publishing declares the destination queue lazily, once per channel.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// True once the channel can no longer carry operations.
    fn is_closed(&self) -> bool;

    /// Publishes without waiting for a broker acknowledgement.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Publishes and waits for the broker's per-message verdict.
    /// `Ok(true)` is an ack, `Ok(false)` a nack.
    async fn publish_confirmed(&self, queue: &str, payload: &[u8])
        -> Result<bool, TransportError>;

    /// Starts a subscription and returns the delivery stream. The stream
    /// ends when the channel dies or the subscription is cancelled.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError>;

    /// Cancels an active subscription by its consumer tag.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    /// Acknowledges `delivery_tag`; with `multiple`, every outstanding tag
    /// up to and including it.
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError>;

    /// Rejects `delivery_tag` (cumulatively with `multiple`), optionally
    /// asking the broker to requeue.
    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError>;

    /// Closes the channel. Idempotent.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(TransportError::ChannelClosed.is_terminal());
        assert!(TransportError::ConnectionClosed.is_terminal());
        assert!(!TransportError::Io("reset by peer".into()).is_terminal());
        assert!(!TransportError::NotFound("orders".into()).is_terminal());
        assert!(!TransportError::Connect("refused".into()).is_terminal());
    }

    #[test]
    fn test_recoverable_is_the_complement() {
        assert!(TransportError::Io("timeout".into()).is_recoverable());
        assert!(!TransportError::ConnectionClosed.is_recoverable());
    }
}
