//! Lifecycle of the realtime channel: handshake, frame pumping onto the event
//! bus, and bounded reconnects after drops.

use crate::auth::{CredentialStore, RefreshCoordinator, access_token_is_valid};
use crate::protocol::{
    self, CONNECTED, CONNECTION_GIVEN_UP, CONNECTION_UNAUTHORIZED, DISCONNECTED, RECONNECTING,
    Frame,
};
use crate::timer::{self, TimerHandle, linear_backoff};
use crate::transport::{DialError, Dialer, RealtimeChannel};
use frame_bus::EventBus;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal until the next explicit `connect()`.
    GivenUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before attempt `n` is `base_delay * n`.
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("no access token available for the realtime handshake")]
    MissingCredentials,
    #[error("realtime handshake rejected the access token")]
    Unauthorized,
    #[error("realtime connection failed: {0}")]
    Network(String),
    #[error("gave up reconnecting after {attempts} attempts")]
    GivenUp { attempts: u32 },
    #[error("realtime channel is not connected")]
    NotConnected,
    #[error("connection attempt was superseded")]
    Superseded,
}

struct Control {
    /// Bumped by every connect, disconnect and reconnect attempt. Tasks
    /// carrying an older epoch do nothing.
    epoch: u64,
    attempts: u32,
    reconnect_timer: Option<TimerHandle>,
    reader: Option<JoinHandle<()>>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

struct Inner {
    dialer: Arc<dyn Dialer>,
    store: CredentialStore,
    /// Renews the access token for background reconnects.
    refresher: Option<Arc<RefreshCoordinator>>,
    bus: EventBus,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    control: Mutex<Control>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let control = self.control.get_mut();
        if let Some(timer) = control.reconnect_timer.take() {
            timer.cancel();
        }
        if let Some(reader) = control.reader.take() {
            reader.abort();
        }
    }
}

/// Owns the realtime channel. Clones share the same connection.
///
/// Lifecycle frames (`connected`, `disconnected`, `reconnecting`,
/// `connection_given_up`, `connection_unauthorized`) are published on the bus
/// alongside server frames, always outside the internal lock.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        store: CredentialStore,
        bus: EventBus,
        policy: ReconnectPolicy,
    ) -> Self {
        Self::build(dialer, store, None, bus, policy)
    }

    /// Like [`ConnectionManager::new`], but a background reconnect whose
    /// access token has expired, or whose handshake is refused, renews the
    /// token through `refresher` and dials again. A failed renewal ends in
    /// `Disconnected` with `connection_unauthorized`.
    pub fn with_refresher(
        dialer: Arc<dyn Dialer>,
        store: CredentialStore,
        bus: EventBus,
        policy: ReconnectPolicy,
        refresher: Arc<RefreshCoordinator>,
    ) -> Self {
        Self::build(dialer, store, Some(refresher), bus, policy)
    }

    fn build(
        dialer: Arc<dyn Dialer>,
        store: CredentialStore,
        refresher: Option<Arc<RefreshCoordinator>>,
        bus: EventBus,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                dialer,
                store,
                refresher,
                bus,
                policy,
                state_tx,
                control: Mutex::new(Control {
                    epoch: 0,
                    attempts: 0,
                    reconnect_timer: None,
                    reader: None,
                    outbound: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Opens the channel with the current access token.
    ///
    /// Returns once the first handshake settles. A network failure leaves the
    /// manager reconnecting in the background and is still reported here.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let (epoch, token) = {
            let mut control = self.inner.control.lock();
            match self.state() {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                ConnectionState::Reconnecting => {
                    if let Some(timer) = control.reconnect_timer.take() {
                        timer.cancel();
                    }
                }
                ConnectionState::Disconnected | ConnectionState::GivenUp => {
                    control.attempts = 0;
                }
            }

            let Some(token) = self.inner.store.access_token() else {
                let previous = self.state();
                control.attempts = 0;
                self.set_state(ConnectionState::Disconnected);
                drop(control);
                if previous != ConnectionState::Disconnected {
                    self.publish_missing_credentials();
                }
                return Err(ConnectionError::MissingCredentials);
            };
            control.epoch += 1;
            self.set_state(ConnectionState::Connecting);
            (control.epoch, token)
        };

        // The handshake runs detached so a cancelled caller cannot strand
        // the manager in `Connecting`.
        let manager = self.clone();
        match tokio::spawn(async move { manager.handshake(epoch, token, false).await }).await {
            Ok(result) => result,
            Err(err) => Err(ConnectionError::Network(err.to_string())),
        }
    }

    /// Closes the channel and cancels any pending reconnect.
    pub fn disconnect(&self) {
        let previous = {
            let mut control = self.inner.control.lock();
            control.epoch += 1;
            if let Some(timer) = control.reconnect_timer.take() {
                timer.cancel();
            }
            if let Some(reader) = control.reader.take() {
                reader.abort();
            }
            control.outbound = None;
            control.attempts = 0;
            let previous = self.state();
            self.set_state(ConnectionState::Disconnected);
            previous
        };

        if previous != ConnectionState::Disconnected {
            info!(target: "mingle::connection", "realtime channel closed by client");
            self.inner
                .bus
                .dispatch(&Frame::new(DISCONNECTED, json!({ "reason": "client" })));
        }
    }

    pub fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        let control = self.inner.control.lock();
        match self.state() {
            ConnectionState::GivenUp => Err(ConnectionError::GivenUp {
                attempts: self.inner.policy.max_attempts,
            }),
            ConnectionState::Connected => match control.outbound.as_ref() {
                Some(outbound) => outbound
                    .send(frame)
                    .map_err(|_| ConnectionError::NotConnected),
                None => Err(ConnectionError::NotConnected),
            },
            _ => Err(ConnectionError::NotConnected),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.inner.state_tx.send_replace(next);
        if previous != next {
            debug!(
                target: "mingle::connection",
                from = ?previous,
                to = ?next,
                "connection state changed"
            );
        }
    }

    fn publish_missing_credentials(&self) {
        self.inner.bus.dispatch(&Frame::new(
            DISCONNECTED,
            json!({ "reason": "missing_credentials" }),
        ));
    }

    /// Dials with `token`. With `renewable` set and a refresher present, a
    /// refused handshake leaves the manager `Reconnecting` so the caller can
    /// renew the token; otherwise it is terminal.
    async fn handshake(
        &self,
        epoch: u64,
        token: String,
        renewable: bool,
    ) -> Result<(), ConnectionError> {
        let result = self.inner.dialer.dial(&token).await;

        let mut events = Vec::new();
        let outcome = {
            let mut control = self.inner.control.lock();
            if control.epoch != epoch {
                trace!(target: "mingle::connection", epoch, "discarding superseded handshake");
                return Err(ConnectionError::Superseded);
            }
            match result {
                Ok(channel) => {
                    control.attempts = 0;
                    control.outbound = Some(channel.sender());
                    self.set_state(ConnectionState::Connected);
                    control.reader = Some(tokio::spawn(pump_frames(
                        Arc::downgrade(&self.inner),
                        self.inner.bus.clone(),
                        channel,
                        epoch,
                    )));
                    info!(target: "mingle::connection", "realtime channel connected");
                    Ok(())
                }
                Err(DialError::Unauthorized) if renewable && self.inner.refresher.is_some() => {
                    debug!(
                        target: "mingle::connection",
                        "realtime handshake unauthorized; renewing access token"
                    );
                    self.set_state(ConnectionState::Reconnecting);
                    Err(ConnectionError::Unauthorized)
                }
                Err(DialError::Unauthorized) => {
                    warn!(target: "mingle::connection", "realtime handshake unauthorized");
                    control.attempts = 0;
                    self.set_state(ConnectionState::Disconnected);
                    events.push(Frame::bare(CONNECTION_UNAUTHORIZED));
                    Err(ConnectionError::Unauthorized)
                }
                Err(DialError::Network(message)) => {
                    warn!(
                        target: "mingle::connection",
                        error = %message,
                        "realtime handshake failed"
                    );
                    self.schedule_reconnect_locked(&mut control, &mut events);
                    Err(ConnectionError::Network(message))
                }
            }
        };

        for frame in &events {
            self.inner.bus.dispatch(frame);
        }
        outcome
    }

    /// Called by the reader once the channel ends on its own.
    fn handle_drop(&self, epoch: u64) {
        let mut events = Vec::new();
        {
            let mut control = self.inner.control.lock();
            if control.epoch != epoch {
                return;
            }
            control.reader = None;
            control.outbound = None;
            warn!(target: "mingle::connection", "realtime channel dropped");
            events.push(Frame::new(DISCONNECTED, json!({ "reason": "network" })));
            self.schedule_reconnect_locked(&mut control, &mut events);
        }
        for frame in &events {
            self.inner.bus.dispatch(frame);
        }
    }

    fn schedule_reconnect_locked(&self, control: &mut Control, events: &mut Vec<Frame>) {
        control.attempts += 1;
        let max_attempts = self.inner.policy.max_attempts;
        if control.attempts > max_attempts {
            error!(
                target: "mingle::connection",
                attempts = max_attempts,
                "exhausted reconnect attempts"
            );
            self.set_state(ConnectionState::GivenUp);
            events.push(Frame::new(
                CONNECTION_GIVEN_UP,
                json!({ "attempts": max_attempts }),
            ));
            return;
        }

        let attempt = control.attempts;
        let delay = linear_backoff(self.inner.policy.base_delay, attempt);
        self.set_state(ConnectionState::Reconnecting);
        events.push(Frame::new(
            RECONNECTING,
            json!({ "attempt": attempt, "delayMs": delay.as_millis() as u64 }),
        ));
        debug!(
            target: "mingle::connection",
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        if let Some(previous) = control.reconnect_timer.take() {
            previous.cancel();
        }
        let weak = Arc::downgrade(&self.inner);
        let epoch = control.epoch;
        control.reconnect_timer = Some(timer::schedule(delay, move || async move {
            if let Some(inner) = weak.upgrade() {
                ConnectionManager { inner }.run_reconnect(epoch).await;
            }
        }));
    }

    async fn run_reconnect(&self, epoch: u64) {
        let pair = {
            let mut control = self.inner.control.lock();
            if control.epoch != epoch || self.state() != ConnectionState::Reconnecting {
                return;
            }
            // Our own handle; the task is already running.
            control.reconnect_timer.take();

            let pair = self.inner.store.get();
            if pair.is_none() {
                info!(target: "mingle::connection", "signed out while reconnecting");
                control.attempts = 0;
                self.set_state(ConnectionState::Disconnected);
            }
            pair
        };
        let Some(pair) = pair else {
            self.publish_missing_credentials();
            return;
        };

        let token = if access_token_is_valid(&pair) || self.inner.refresher.is_none() {
            pair.access_token
        } else {
            debug!(target: "mingle::connection", "access token expired; renewing before reconnect");
            match self.renew_access_token(epoch).await {
                Some(token) => token,
                None => return,
            }
        };

        let Some(attempt) = self.begin_attempt(epoch) else {
            return;
        };
        match self.handshake(attempt, token, true).await {
            Err(ConnectionError::Unauthorized) if self.inner.refresher.is_some() => {
                let Some(token) = self.renew_access_token(attempt).await else {
                    return;
                };
                let Some(retry) = self.begin_attempt(attempt) else {
                    return;
                };
                if let Err(err) = self.handshake(retry, token, false).await {
                    trace!(target: "mingle::connection", error = %err, "reconnect after renewal failed");
                }
            }
            Err(err) => {
                trace!(target: "mingle::connection", error = %err, "reconnect attempt failed");
            }
            Ok(()) => {}
        }
    }

    /// Moves a still-current reconnect into `Connecting` under a fresh epoch.
    fn begin_attempt(&self, epoch: u64) -> Option<u64> {
        let mut control = self.inner.control.lock();
        if control.epoch != epoch || self.state() != ConnectionState::Reconnecting {
            return None;
        }
        control.epoch += 1;
        self.set_state(ConnectionState::Connecting);
        Some(control.epoch)
    }

    /// Returns the renewed access token, or `None` when the reconnect was
    /// superseded or the session could not be renewed.
    async fn renew_access_token(&self, epoch: u64) -> Option<String> {
        let refresher = self.inner.refresher.as_ref()?;
        let outcome = refresher.refresh().await;

        let mut control = self.inner.control.lock();
        if control.epoch != epoch || self.state() != ConnectionState::Reconnecting {
            return None;
        }
        match outcome {
            Ok(pair) => Some(pair.access_token),
            Err(err) => {
                warn!(
                    target: "mingle::connection",
                    error = %err,
                    "could not renew access token; closing realtime channel"
                );
                control.attempts = 0;
                self.set_state(ConnectionState::Disconnected);
                drop(control);
                self.inner.bus.dispatch(&Frame::new(
                    CONNECTION_UNAUTHORIZED,
                    json!({ "reason": "session_expired" }),
                ));
                None
            }
        }
    }
}

/// Publishes `connected`, then every inbound frame in arrival order.
async fn pump_frames(inner: Weak<Inner>, bus: EventBus, mut channel: RealtimeChannel, epoch: u64) {
    bus.dispatch(&Frame::bare(CONNECTED));
    while let Some(frame) = channel.recv().await {
        if protocol::is_lifecycle(&frame.name) {
            warn!(
                target: "mingle::connection",
                event = %frame.name,
                "dropping server frame with a reserved name"
            );
            continue;
        }
        trace!(target: "mingle::connection", event = %frame.name, "frame received");
        bus.dispatch(&frame);
    }
    drop(channel);
    if let Some(inner) = inner.upgrade() {
        ConnectionManager { inner }.handle_drop(epoch);
    }
}
