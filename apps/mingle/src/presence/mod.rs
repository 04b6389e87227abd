//! Folds server frames into the presence roster, the typing set and the
//! notification queue, and publishes the result as a [`PresenceView`].

pub mod frames;
pub mod notifications;
pub mod roster;
pub mod typing;

pub use notifications::{Category, Notification, NotificationQueue};
pub use roster::{PeerPresence, PeerStatus, Roster};
pub use typing::TypingKey;

use crate::protocol;
use crate::timer::{self, TimerHandle};
use frame_bus::{EventBus, Frame, Subscription};
use frames::{NotificationFrame, PeerJoined, PeerLeft, PeerStatusChanged, TypingFrame};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Clears a typing indicator whose `typing_stopped` never arrived.
    /// `None` keeps indicators until stopped.
    pub typing_timeout: Option<Duration>,
    /// Window in which a repeat `(category, source peer)` is dropped.
    pub dedupe_window: Duration,
    pub capacity: usize,
    pub activity_ttl: Duration,
    pub proximity_ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            typing_timeout: Some(Duration::from_secs(8)),
            dedupe_window: Duration::from_secs(10),
            capacity: 50,
            activity_ttl: Duration::from_secs(10),
            proximity_ttl: Duration::from_secs(30),
        }
    }
}

impl PresenceConfig {
    fn default_ttl(&self, category: Category) -> Option<Duration> {
        match category {
            Category::Activity => Some(self.activity_ttl),
            Category::Proximity => Some(self.proximity_ttl),
            _ => None,
        }
    }
}

/// Read model handed to the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceView {
    pub roster: Roster,
    pub typing: BTreeSet<TypingKey>,
    /// Oldest first.
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
    /// Set once reconnecting has been given up or the handshake was refused;
    /// cleared by the next successful connect or [`Reconciler::dismiss_offline`].
    pub offline: bool,
}

struct TypingEntry {
    token: u64,
    timer: Option<TimerHandle>,
}

struct Expiry {
    token: u64,
    timer: TimerHandle,
}

struct State {
    roster: Roster,
    typing: BTreeMap<TypingKey, TypingEntry>,
    notifications: NotificationQueue,
    expiries: HashMap<String, Expiry>,
    recent_sources: HashMap<(Category, String), Instant>,
    recent_ids: HashMap<String, Instant>,
    offline: bool,
    next_token: u64,
}

impl State {
    fn new(capacity: usize) -> Self {
        Self {
            roster: Roster::default(),
            typing: BTreeMap::new(),
            notifications: NotificationQueue::new(capacity),
            expiries: HashMap::new(),
            recent_sources: HashMap::new(),
            recent_ids: HashMap::new(),
            offline: false,
            next_token: 0,
        }
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn view(&self) -> PresenceView {
        PresenceView {
            roster: self.roster.clone(),
            typing: self.typing.keys().cloned().collect(),
            notifications: self.notifications.iter().cloned().collect(),
            unread_count: self.notifications.unread_count(),
            offline: self.offline,
        }
    }

    fn cancel_expiry(&mut self, id: &str) {
        if let Some(expiry) = self.expiries.remove(id) {
            expiry.timer.cancel();
        }
    }

    fn cancel_all_timers(&mut self) {
        for (_, entry) in std::mem::take(&mut self.typing) {
            if let Some(timer) = entry.timer {
                timer.cancel();
            }
        }
        for (_, expiry) in self.expiries.drain() {
            expiry.timer.cancel();
        }
    }
}

struct Shared {
    config: PresenceConfig,
    state: Mutex<State>,
    view: watch::Sender<PresenceView>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.state.get_mut().cancel_all_timers();
    }
}

/// Keeps the presence state in step with the event bus. Handlers are
/// removed when the last clone is dropped.
#[derive(Clone)]
pub struct Reconciler {
    shared: Arc<Shared>,
}

impl Reconciler {
    pub fn attach(bus: &EventBus, config: PresenceConfig) -> Self {
        let (view, _) = watch::channel(PresenceView::default());
        let shared = Arc::new(Shared {
            state: Mutex::new(State::new(config.capacity)),
            config,
            view,
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&shared);
        let mut subscriptions = vec![
            bus.on_typed(protocol::PEER_JOINED, bind(weak.clone(), Shared::peer_joined)),
            bus.on_typed(protocol::PEER_LEFT, bind(weak.clone(), Shared::peer_left)),
            bus.on_typed(
                protocol::PEER_STATUS_CHANGED,
                bind(weak.clone(), Shared::peer_status_changed),
            ),
            bus.on_typed(
                protocol::TYPING_STARTED,
                bind(weak.clone(), Shared::typing_started),
            ),
            bus.on_typed(
                protocol::TYPING_STOPPED,
                bind(weak.clone(), Shared::typing_stopped),
            ),
        ];
        for (name, offline) in [
            (protocol::CONNECTED, false),
            (protocol::CONNECTION_GIVEN_UP, true),
            (protocol::CONNECTION_UNAUTHORIZED, true),
        ] {
            let weak = weak.clone();
            subscriptions.push(bus.on(name, move |_: &Frame| {
                if let Some(shared) = weak.upgrade() {
                    shared.set_offline(offline);
                }
            }));
        }
        for name in [
            protocol::MATCH_FOUND,
            protocol::INTRODUCTION_RECEIVED,
            protocol::MEETUP_SCHEDULED,
            protocol::PROXIMITY_ALERT,
            protocol::ACTIVITY_PING,
        ] {
            let weak = weak.clone();
            subscriptions.push(bus.on(name, move |frame: &Frame| {
                if let Some(shared) = weak.upgrade() {
                    shared.notification(frame);
                }
            }));
        }
        *shared.subscriptions.lock() = subscriptions;

        Self { shared }
    }

    pub fn view(&self) -> PresenceView {
        self.shared.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PresenceView> {
        self.shared.view.subscribe()
    }

    /// Removes the entry and cancels its pending expiry.
    pub fn dismiss(&self, id: &str) -> bool {
        let mut state = self.shared.state.lock();
        state.cancel_expiry(id);
        let removed = state.notifications.remove(id).is_some();
        if removed {
            self.shared.publish(&state);
        }
        removed
    }

    pub fn mark_read(&self, id: &str) -> bool {
        let mut state = self.shared.state.lock();
        let changed = state.notifications.mark_read(id);
        if changed {
            self.shared.publish(&state);
        }
        changed
    }

    pub fn mark_all_read(&self) -> usize {
        let mut state = self.shared.state.lock();
        let changed = state.notifications.mark_all_read();
        if changed > 0 {
            self.shared.publish(&state);
        }
        changed
    }

    pub fn dismiss_offline(&self) {
        self.shared.set_offline(false);
    }

    /// Forgets everything, e.g. after sign-out.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        state.cancel_all_timers();
        *state = State::new(self.shared.config.capacity);
        self.shared.publish(&state);
        debug!(target: "mingle::presence", "presence state reset");
    }
}

/// Adapts a `Shared` method into a bus handler holding only a weak reference.
fn bind<T>(weak: Weak<Shared>, apply: fn(&Arc<Shared>, T)) -> impl Fn(T) + Send + Sync + 'static
where
    T: 'static,
{
    move |payload: T| {
        if let Some(shared) = weak.upgrade() {
            apply(&shared, payload);
        }
    }
}

impl Shared {
    fn publish(&self, state: &State) {
        self.view.send_replace(state.view());
    }

    fn set_offline(&self, offline: bool) {
        let mut state = self.state.lock();
        if state.offline != offline {
            state.offline = offline;
            self.publish(&state);
        }
    }

    fn peer_joined(self: &Arc<Self>, frame: PeerJoined) {
        let mut state = self.state.lock();
        state
            .roster
            .join(&frame.peer_id, frame.name, frame.status.unwrap_or_default());
        trace!(target: "mingle::presence", peer = %frame.peer_id, "peer joined");
        self.publish(&state);
    }

    fn peer_left(self: &Arc<Self>, frame: PeerLeft) {
        let mut state = self.state.lock();
        let was_present = state.roster.leave(&frame.peer_id).is_some();
        let stale: Vec<TypingKey> = state
            .typing
            .keys()
            .filter(|key| key.peer_id == frame.peer_id)
            .cloned()
            .collect();
        for key in &stale {
            if let Some(TypingEntry {
                timer: Some(timer), ..
            }) = state.typing.remove(key)
            {
                timer.cancel();
            }
        }
        if was_present || !stale.is_empty() {
            trace!(target: "mingle::presence", peer = %frame.peer_id, "peer left");
            self.publish(&state);
        }
    }

    fn peer_status_changed(self: &Arc<Self>, frame: PeerStatusChanged) {
        let mut state = self.state.lock();
        if state.roster.set_status(&frame.peer_id, frame.status) {
            self.publish(&state);
        } else {
            trace!(
                target: "mingle::presence",
                peer = %frame.peer_id,
                "ignoring status change for absent peer"
            );
        }
    }

    fn typing_started(self: &Arc<Self>, frame: TypingFrame) {
        let key = TypingKey::new(frame.peer_id, frame.conversation_id);
        let mut state = self.state.lock();
        let token = state.token();
        let timer = self.config.typing_timeout.map(|timeout| {
            let weak = Arc::downgrade(self);
            let key = key.clone();
            timer::schedule(timeout, move || async move {
                if let Some(shared) = weak.upgrade() {
                    shared.typing_timed_out(&key, token);
                }
            })
        });
        let is_new = !state.typing.contains_key(&key);
        if let Some(previous) = state.typing.insert(key, TypingEntry { token, timer }) {
            if let Some(timer) = previous.timer {
                timer.cancel();
            }
        }
        if is_new {
            self.publish(&state);
        }
    }

    fn typing_stopped(self: &Arc<Self>, frame: TypingFrame) {
        let key = TypingKey::new(frame.peer_id, frame.conversation_id);
        let mut state = self.state.lock();
        if let Some(entry) = state.typing.remove(&key) {
            if let Some(timer) = entry.timer {
                timer.cancel();
            }
            self.publish(&state);
        }
    }

    fn typing_timed_out(&self, key: &TypingKey, token: u64) {
        let mut state = self.state.lock();
        if state.typing.get(key).map(|entry| entry.token) == Some(token) {
            // The handle belongs to this running task; dropping it is enough.
            state.typing.remove(key);
            debug!(
                target: "mingle::presence",
                peer = %key.peer_id,
                conversation = %key.conversation_id,
                "typing indicator expired"
            );
            self.publish(&state);
        }
    }

    fn notification(self: &Arc<Self>, frame: &Frame) {
        let Some(category) = Category::from_frame(&frame.name) else {
            return;
        };
        let payload = if frame.payload.is_null() {
            NotificationFrame::default()
        } else {
            match serde_json::from_value::<NotificationFrame>(frame.payload.clone()) {
                Ok(payload) => payload,
                Err(err) => {
                    debug!(
                        target: "mingle::presence",
                        frame = %frame.name,
                        error = %err,
                        "dropping malformed notification"
                    );
                    return;
                }
            }
        };

        let now = Instant::now();
        let window = self.config.dedupe_window;
        let mut state = self.state.lock();
        state
            .recent_sources
            .retain(|_, seen| now.duration_since(*seen) < window);
        state
            .recent_ids
            .retain(|_, seen| now.duration_since(*seen) < window);

        if let Some(id) = payload.id.as_deref() {
            if state.notifications.contains(id) || state.recent_ids.contains_key(id) {
                trace!(target: "mingle::presence", id, "dropping duplicate notification");
                return;
            }
        }
        if let Some(source) = payload.source_peer_id.as_deref() {
            if state
                .recent_sources
                .contains_key(&(category, source.to_string()))
            {
                trace!(
                    target: "mingle::presence",
                    ?category,
                    source,
                    "dropping repeated notification"
                );
                return;
            }
        }

        let id = payload
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let ttl = payload
            .ttl_seconds
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
            .or_else(|| self.config.default_ttl(category));

        state.recent_ids.insert(id.clone(), now);
        if let Some(source) = payload.source_peer_id.clone() {
            state.recent_sources.insert((category, source), now);
        }

        let entry = Notification {
            id: id.clone(),
            category,
            title: payload
                .title
                .unwrap_or_else(|| category.default_title().to_string()),
            body: payload.body.unwrap_or_default(),
            source_peer_id: payload.source_peer_id,
            created_at: OffsetDateTime::now_utc(),
            read: false,
            ttl,
        };
        for evicted in state.notifications.push(entry) {
            state.cancel_expiry(&evicted.id);
        }

        if let Some(ttl) = ttl {
            let token = state.token();
            let weak = Arc::downgrade(self);
            let expiring = id.clone();
            let timer = timer::schedule(ttl, move || async move {
                if let Some(shared) = weak.upgrade() {
                    shared.expire(&expiring, token);
                }
            });
            state.expiries.insert(id.clone(), Expiry { token, timer });
        }

        debug!(target: "mingle::presence", ?category, id = %id, "notification queued");
        self.publish(&state);
    }

    fn expire(&self, id: &str, token: u64) {
        let mut state = self.state.lock();
        if state.expiries.get(id).map(|expiry| expiry.token) != Some(token) {
            return;
        }
        state.expiries.remove(id);
        if state.notifications.remove(id).is_some() {
            trace!(target: "mingle::presence", id, "notification expired");
            self.publish(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attach() -> (EventBus, Reconciler) {
        let bus = EventBus::new();
        let reconciler = Reconciler::attach(&bus, PresenceConfig::default());
        (bus, reconciler)
    }

    #[tokio::test]
    async fn roster_follows_arrival_order() {
        let (bus, reconciler) = attach();
        bus.publish("peer_joined", json!({"peerId": "p1", "name": "Ada"}));
        bus.publish("peer_joined", json!({"peerId": "p2", "status": "away"}));
        bus.publish("peer_status_changed", json!({"peerId": "p1", "status": "busy"}));

        let view = reconciler.view();
        assert_eq!(view.roster.len(), 2);
        assert_eq!(view.roster.get("p1").unwrap().status, PeerStatus::Busy);
        assert_eq!(view.roster.get("p2").unwrap().name, "p2");
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_change_nothing() {
        let (bus, reconciler) = attach();
        bus.publish("peer_joined", json!({"name": "no id"}));
        bus.publish("peer_status_changed", json!({"peerId": "p1", "status": "dancing"}));
        bus.publish("weather_report", json!({"sunny": true}));
        assert_eq!(reconciler.view(), PresenceView::default());
    }

    #[tokio::test]
    async fn leaving_clears_typing_for_that_peer() {
        let (bus, reconciler) = attach();
        bus.publish("peer_joined", json!({"peerId": "p1"}));
        bus.publish("typing_started", json!({"peerId": "p1", "conversationId": "c1"}));
        bus.publish("typing_started", json!({"peerId": "p1", "conversationId": "c1"}));
        bus.publish("typing_started", json!({"peerId": "p2", "conversationId": "c1"}));
        assert_eq!(reconciler.view().typing.len(), 2);

        bus.publish("peer_left", json!({"peerId": "p1"}));
        let typing = reconciler.view().typing;
        assert_eq!(typing.len(), 1);
        assert!(typing.contains(&TypingKey::new("p2", "c1")));
    }

    #[tokio::test(start_paused = true)]
    async fn typing_indicator_times_out() {
        let (bus, reconciler) = attach();
        bus.publish("typing_started", json!({"peerId": "p1", "conversationId": "c1"}));
        tokio::time::sleep(Duration::from_secs(5)).await;
        // Re-arms the timeout.
        bus.publish("typing_started", json!({"peerId": "p1", "conversationId": "c1"}));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(reconciler.view().typing.len(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(reconciler.view().typing.is_empty());
    }

    #[tokio::test]
    async fn typing_stopped_removes_key() {
        let (bus, reconciler) = attach();
        bus.publish("typing_started", json!({"peerId": "p1", "conversationId": "c1"}));
        bus.publish("typing_stopped", json!({"peerId": "p1", "conversationId": "c1"}));
        assert!(reconciler.view().typing.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_dedupe_by_source_and_id() {
        let (bus, reconciler) = attach();
        bus.publish("match_found", json!({"id": "m1", "sourcePeerId": "p1"}));
        bus.publish("match_found", json!({"id": "m2", "sourcePeerId": "p1"}));
        bus.publish("introduction_received", json!({"id": "m1"}));
        bus.publish("introduction_received", json!({"sourcePeerId": "p1"}));

        let view = reconciler.view();
        assert_eq!(view.notifications.len(), 2);
        assert_eq!(view.unread_count, 2);
        assert_eq!(view.notifications[0].title, "New match");

        tokio::time::sleep(Duration::from_secs(11)).await;
        bus.publish("match_found", json!({"id": "m3", "sourcePeerId": "p1"}));
        assert_eq!(reconciler.view().notifications.len(), 3);
    }

    #[tokio::test]
    async fn read_state_and_dismissal() {
        let (bus, reconciler) = attach();
        bus.publish("meetup_scheduled", json!({"id": "a", "title": "Coffee"}));
        bus.publish("meetup_scheduled", json!({"id": "b"}));
        assert!(reconciler.mark_read("a"));
        assert_eq!(reconciler.view().unread_count, 1);
        assert_eq!(reconciler.mark_all_read(), 1);
        assert!(reconciler.dismiss("a"));
        assert!(!reconciler.dismiss("a"));
        let view = reconciler.view();
        assert_eq!(view.notifications.len(), 1);
        assert_eq!(view.unread_count, 0);
    }

    #[tokio::test]
    async fn capacity_drops_oldest() {
        let bus = EventBus::new();
        let reconciler = Reconciler::attach(
            &bus,
            PresenceConfig {
                capacity: 3,
                ..PresenceConfig::default()
            },
        );
        for n in 0..5 {
            bus.publish("match_found", json!({"id": format!("m{n}")}));
        }
        let ids: Vec<String> = reconciler
            .view()
            .notifications
            .into_iter()
            .map(|entry| entry.id)
            .collect();
        assert_eq!(ids, ["m2", "m3", "m4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn payload_ttl_overrides_default() {
        let (bus, reconciler) = attach();
        bus.publish("proximity_alert", json!({"id": "near", "ttlSeconds": 2}));
        bus.publish("meetup_scheduled", json!({"id": "kept"}));
        tokio::time::sleep(Duration::from_secs(3)).await;
        let ids: Vec<String> = reconciler
            .view()
            .notifications
            .into_iter()
            .map(|entry| entry.id)
            .collect();
        assert_eq!(ids, ["kept"]);
    }

    #[tokio::test]
    async fn offline_indicator_tracks_lifecycle_frames() {
        let (bus, reconciler) = attach();
        bus.publish("connection_given_up", json!({"attempts": 5}));
        assert!(reconciler.view().offline);
        bus.publish("connected", serde_json::Value::Null);
        assert!(!reconciler.view().offline);

        bus.publish("connection_given_up", json!({"attempts": 5}));
        reconciler.dismiss_offline();
        assert!(!reconciler.view().offline);

        bus.publish("connection_unauthorized", json!({"reason": "session_expired"}));
        assert!(reconciler.view().offline);
    }

    #[tokio::test]
    async fn reset_and_drop() {
        let (bus, reconciler) = attach();
        bus.publish("peer_joined", json!({"peerId": "p1"}));
        bus.publish("activity_ping", json!({"id": "x"}));
        reconciler.reset();
        assert_eq!(reconciler.view(), PresenceView::default());

        let watcher = reconciler.watch();
        drop(reconciler);
        assert_eq!(bus.handler_count("peer_joined"), 0);
        assert!(watcher.has_changed().is_err());
    }
}
