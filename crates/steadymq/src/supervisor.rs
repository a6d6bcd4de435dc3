//! Connection supervision: loss detection and reconnect ownership.
//!
//! The supervisor owns the single broker session. Loss is detected two
//! ways at once: the session's asynchronous close notification (primary)
//! and a periodic health probe (failsafe for events lost under load).
//! Both triggers funnel into one CAS-guarded reconnect entry point, so a
//! storm of detections still produces exactly one reconnect task.

use crate::config::Config;
use crate::consumer::Consumer;
use crate::error::Error;
use crate::transport::{Session, Transport};
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Lifecycle of the supervised connection.
///
/// `Closed` is terminal; every other state may be revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Initial connect in progress.
    Connecting = 0,
    /// A live session is installed.
    Connected = 1,
    /// The session was lost; a reconnect task owns recovery.
    Reconnecting = 2,
    /// Torn down for good.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Reconnecting,
            _ => Self::Closed,
        }
    }
}

/// Thin sized wrapper so the session slot can live in an `ArcSwapOption`
/// (trait objects are fat pointers and cannot be swapped directly).
struct SessionSlot(Arc<dyn Session>);

/// Owns the broker session and drives recovery.
///
/// Producers and consumers hold an `Arc<Supervisor>` and observe its
/// state through atomics and a `watch` channel; none of the accessors on
/// the publish path take a lock.
pub struct Supervisor {
    transport: Arc<dyn Transport>,
    config: Config,
    state: AtomicU8,
    state_tx: watch::Sender<ConnectionState>,
    session: ArcSwapOption<SessionSlot>,
    closed: AtomicBool,
    /// Reconnect ownership flag; set with CAS so exactly one task recovers.
    reconnecting: AtomicBool,
    /// Consumers to resubscribe after every successful connect.
    /// Back-references only, never ownership.
    consumers: Mutex<Vec<Weak<Consumer>>>,
    /// Producer flush wakers to poke after every successful connect.
    connect_wakers: Mutex<Vec<Weak<Notify>>>,
}

impl Supervisor {
    /// Connects to the broker and starts supervision.
    ///
    /// The initial connect is bounded by `config.connect_timeout`; on
    /// failure nothing is left running.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: Config,
    ) -> Result<Arc<Self>, Error> {
        config.validate()?;

        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let supervisor = Arc::new(Self {
            transport,
            config,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            state_tx,
            session: ArcSwapOption::empty(),
            closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            connect_wakers: Mutex::new(Vec::new()),
        });

        let session = tokio::time::timeout(
            supervisor.config.connect_timeout,
            supervisor.transport.connect(),
        )
        .await
        .map_err(|_| Error::Connection("initial connect timed out".into()))?
        .map_err(|err| Error::Connection(err.to_string()))?;

        Self::install_session(&supervisor, session);
        Self::spawn_health_probe(&supervisor);
        Ok(supervisor)
    }

    /// Current state, lock-free.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Subscribes to state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// True once `close` has begun.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Non-blocking session accessor. The returned session may already be
    /// dead; callers find out when their next operation on it fails.
    pub fn try_session(&self) -> Option<Arc<dyn Session>> {
        self.session.load_full().map(|slot| Arc::clone(&slot.0))
    }

    /// Session accessor that polls until a session is installed.
    /// Fails with [`Error::Closed`] once the supervisor is closed.
    pub async fn session(&self) -> Result<Arc<dyn Session>, Error> {
        loop {
            if let Some(session) = self.try_session() {
                return Ok(session);
            }
            if self.is_closed() {
                return Err(Error::Closed);
            }
            tokio::time::sleep(self.config.session_poll_interval).await;
        }
    }

    /// Bounded-patience variant of [`session`](Self::session), used by
    /// flush paths that would rather fail than stall.
    pub async fn session_with_retry(
        &self,
        attempts: u32,
        delay: Duration,
    ) -> Result<Arc<dyn Session>, Error> {
        for attempt in 0..attempts {
            if self.is_closed() {
                return Err(Error::Closed);
            }
            if let Some(session) = self.try_session() {
                return Ok(session);
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        Err(Error::Connection("no session available".into()))
    }

    /// The shared configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers a consumer for the post-connect resubscribe fan-out.
    pub(crate) fn register_consumer(&self, consumer: &Arc<Consumer>) {
        self.consumers.lock().unwrap().push(Arc::downgrade(consumer));
    }

    /// Registers a producer flush waker poked after every reconnect, so
    /// recovery latency is one round trip instead of one flush interval.
    pub(crate) fn register_connect_waker(&self, waker: &Arc<Notify>) {
        self.connect_wakers
            .lock()
            .unwrap()
            .push(Arc::downgrade(waker));
    }

    /// Closes the supervisor. The CAS winner performs teardown; duplicate
    /// closes are no-ops. Terminal: no reconnect will run afterwards.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("supervisor closing");
        self.set_state(ConnectionState::Closed);
        if let Some(slot) = self.session.swap(None) {
            slot.0.close().await;
        }
    }

    // ---------------------------------------------------------------------
    // RECONNECT MACHINERY
    // ---------------------------------------------------------------------

    /// Single entry point for both loss triggers. The CAS on
    /// `reconnecting` elects exactly one owner; losers return immediately.
    /// Never called (and never to be called) while holding a lock.
    pub(crate) fn begin_reconnect(this: &Arc<Self>) {
        if this.is_closed() {
            return;
        }
        if this
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let weak = Arc::downgrade(this);
        tokio::spawn(async move {
            Self::run_reconnect(weak).await;
        });
    }

    async fn run_reconnect(weak: Weak<Supervisor>) {
        let (initial_delay, max_delay, multiplier) = {
            let Some(supervisor) = weak.upgrade() else {
                return;
            };
            supervisor.set_state(ConnectionState::Reconnecting);
            info!("connection lost, reconnecting");
            (
                supervisor.config.reconnect_initial_delay,
                supervisor.config.reconnect_max_delay,
                supervisor.config.reconnect_multiplier,
            )
        };

        // First attempt is immediate; subsequent delays grow
        // geometrically and saturate at the configured maximum.
        let mut delay = Duration::ZERO;
        let mut next_delay = initial_delay;
        loop {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let Some(supervisor) = weak.upgrade() else {
                return;
            };
            if supervisor.is_closed() {
                supervisor.reconnecting.store(false, Ordering::Release);
                return;
            }
            match supervisor.transport.connect().await {
                Ok(session) => {
                    if supervisor.is_closed() {
                        // Closed mid-reconnect: honor the terminal state.
                        session.close().await;
                        supervisor.reconnecting.store(false, Ordering::Release);
                        return;
                    }
                    Self::install_session(&supervisor, session);
                    info!("reconnected");
                    return;
                }
                Err(err) => {
                    delay = next_delay;
                    next_delay = cap_delay(next_delay.mul_f64(multiplier), max_delay);
                    warn!(%err, retry_in_ms = delay.as_millis() as u64, "reconnect attempt failed");
                }
            }
        }
    }

    /// Publishes a fresh session and runs the post-connect fan-out.
    /// Used by both the initial connect and every reconnect.
    fn install_session(this: &Arc<Self>, session: Arc<dyn Session>) {
        this.session
            .store(Some(Arc::new(SessionSlot(Arc::clone(&session)))));
        if this.is_closed() {
            // Lost a race with close(): honor the terminal state.
            if let Some(slot) = this.session.swap(None) {
                tokio::spawn(async move { slot.0.close().await });
            }
            this.reconnecting.store(false, Ordering::Release);
            return;
        }
        this.set_state(ConnectionState::Connected);
        Self::spawn_session_watcher(this, session);
        this.reconnecting.store(false, Ordering::Release);
        this.notify_connected();
        this.resubscribe_all();
    }

    /// Event-driven loss trigger: one short-lived task per session awaits
    /// its close notification.
    fn spawn_session_watcher(this: &Arc<Self>, session: Arc<dyn Session>) {
        let weak = Arc::downgrade(this);
        let mut closed_rx = session.closed();
        tokio::spawn(async move {
            loop {
                if closed_rx.borrow().is_some() {
                    break;
                }
                if closed_rx.changed().await.is_err() {
                    // Sender gone: the session object was dropped, which
                    // only happens after it has been replaced. Not a loss.
                    return;
                }
            }
            if let Some(reason) = closed_rx.borrow().clone() {
                warn!(code = reason.code, text = %reason.text, "session close notification");
            }
            if let Some(supervisor) = weak.upgrade() {
                if !supervisor.is_closed() {
                    Self::begin_reconnect(&supervisor);
                }
            }
        });
    }

    /// Polling failsafe: catches a dead session whose close event never
    /// fired (or was lost under load).
    fn spawn_health_probe(this: &Arc<Self>) {
        let weak = Arc::downgrade(this);
        let period = this.config.health_check_interval;
        tokio::spawn(async move {
            let mut probe = tokio::time::interval(period);
            probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                probe.tick().await;
                let Some(supervisor) = weak.upgrade() else {
                    return;
                };
                if supervisor.is_closed() {
                    return;
                }
                if supervisor.state() == ConnectionState::Connected {
                    if let Some(session) = supervisor.try_session() {
                        if session.is_closed() {
                            debug!("health probe found a dead session");
                            Self::begin_reconnect(&supervisor);
                        }
                    }
                }
            }
        });
    }

    /// Kicks every registered consumer's resubscribe concurrently, so one
    /// slow queue does not hold up the others. Runs after every successful
    /// connect, including the first.
    fn resubscribe_all(&self) {
        let mut consumers = self.consumers.lock().unwrap();
        consumers.retain(|weak| weak.strong_count() > 0);
        for weak in consumers.iter() {
            if let Some(consumer) = weak.upgrade() {
                tokio::spawn(async move {
                    consumer.resubscribe().await;
                });
            }
        }
    }

    fn notify_connected(&self) {
        let mut wakers = self.connect_wakers.lock().unwrap();
        wakers.retain(|weak| weak.strong_count() > 0);
        for weak in wakers.iter() {
            if let Some(waker) = weak.upgrade() {
                waker.notify_one();
            }
        }
    }

    /// Serializes the atomic state word before the watch notification so
    /// observers never see a notification ahead of the state itself.
    fn set_state(&self, state: ConnectionState) {
        if self.is_closed() && state != ConnectionState::Closed {
            return;
        }
        self.state.store(state as u8, Ordering::Release);
        self.state_tx.send_replace(state);
        debug!(state = ?state, "connection state changed");
    }
}

fn cap_delay(delay: Duration, max: Duration) -> Duration {
    delay.min(max)
}
