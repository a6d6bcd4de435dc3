//! Client configuration.

use crate::error::Error;
use std::time::Duration;

/// Tunables shared by the supervisor, producers and consumers.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-producer publish buffer capacity.
    ///
    /// Default: 10,000
    pub buffer_size: usize,

    /// Delay before the second reconnect attempt (the first retries
    /// immediately after loss).
    ///
    /// Default: 100ms
    pub reconnect_initial_delay: Duration,

    /// Upper bound for the exponential reconnect delay.
    ///
    /// Default: 30s
    pub reconnect_max_delay: Duration,

    /// Multiplier applied to the reconnect delay after each failed attempt.
    ///
    /// Default: 2.0
    pub reconnect_multiplier: f64,

    /// Interval of the polling failsafe that double-checks the session's
    /// closed flag. The close event is the primary loss signal; the probe
    /// catches events lost under load.
    ///
    /// Default: 1s
    pub health_check_interval: Duration,

    /// Interval of each producer's background flush pass.
    ///
    /// Default: 100ms
    pub flush_interval: Duration,

    /// How long the initial connect may take before failing.
    ///
    /// Default: 10s
    pub connect_timeout: Duration,

    /// Poll interval used by `Supervisor::session` while waiting for a
    /// live session.
    ///
    /// Default: 100ms
    pub session_poll_interval: Duration,

    /// Per-message send attempts in the flush loop before the payload is
    /// dropped with `FlushRetryExceeded`.
    ///
    /// Default: 3
    pub max_flush_retries: u32,

    /// Server-side cap on unacknowledged deliveries per consumer.
    ///
    /// Default: 100
    pub prefetch: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: 10_000,
            reconnect_initial_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_multiplier: 2.0,
            health_check_interval: Duration::from_secs(1),
            flush_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
            session_poll_interval: Duration::from_millis(100),
            max_flush_retries: 3,
            prefetch: 100,
        }
    }
}

impl Config {
    /// Sets the per-producer buffer capacity.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets the reconnect backoff parameters.
    pub fn with_reconnect_backoff(
        mut self,
        initial: Duration,
        max: Duration,
        multiplier: f64,
    ) -> Self {
        self.reconnect_initial_delay = initial;
        self.reconnect_max_delay = max;
        self.reconnect_multiplier = multiplier;
        self
    }

    /// Sets the health-probe interval.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Sets the producer flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the initial connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the consumer prefetch window.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be non-zero".into()));
        }
        if self.reconnect_multiplier < 1.0 {
            return Err(Error::Config(
                "reconnect_multiplier must be at least 1.0".into(),
            ));
        }
        if self.reconnect_initial_delay.is_zero() {
            return Err(Error::Config(
                "reconnect_initial_delay must be non-zero".into(),
            ));
        }
        if self.reconnect_max_delay < self.reconnect_initial_delay {
            return Err(Error::Config(
                "reconnect_max_delay must be >= reconnect_initial_delay".into(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::Config("flush_interval must be non-zero".into()));
        }
        if self.health_check_interval.is_zero() {
            return Err(Error::Config(
                "health_check_interval must be non-zero".into(),
            ));
        }
        if self.max_flush_retries == 0 {
            return Err(Error::Config("max_flush_retries must be non-zero".into()));
        }
        Ok(())
    }
}
