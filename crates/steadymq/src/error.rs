//! Error taxonomy for the client surface.

use crate::transport::TransportError;
use std::fmt;
use thiserror::Error;

/// Errors surfaced to library users.
#[derive(Debug, Error)]
pub enum Error {
    /// The publish buffer is at capacity and the producer uses the
    /// `Raise` overflow policy.
    #[error("publish buffer is full")]
    BufferFull,

    /// The broker could not be reached (initial connect timeout, or no
    /// live session within the retry budget).
    #[error("connection failed: {0}")]
    Connection(String),

    /// The component (or its supervisor) has been closed.
    #[error("client is closed")]
    Closed,

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Error reported by the broker transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl Error {
    /// Returns `true` if the error indicates the component is permanently
    /// unusable.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Why the library discarded a payload instead of delivering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Evicted (or refused) because the publish buffer was at capacity.
    BufferFull,
    /// Discarded because no connection was available and buffering was
    /// not permitted.
    Disconnected,
    /// Refused because the producer was already closed.
    Closed,
    /// Expired before it could be flushed.
    TtlExpired,
    /// Gave up after the per-message flush retry budget was exhausted.
    FlushRetryExceeded,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BufferFull => "buffer-full",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
            Self::TtlExpired => "ttl-expired",
            Self::FlushRetryExceeded => "flush-retry-exceeded",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(Error::Closed.is_terminal());
        assert!(!Error::BufferFull.is_terminal());
        assert!(!Error::Connection("refused".into()).is_terminal());
    }

    #[test]
    fn test_drop_reason_labels() {
        assert_eq!(DropReason::BufferFull.to_string(), "buffer-full");
        assert_eq!(
            DropReason::FlushRetryExceeded.to_string(),
            "flush-retry-exceeded"
        );
    }
}
