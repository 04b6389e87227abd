//! In-process publish/subscribe registry for realtime frames.
//!
//! Handlers for a frame name run synchronously, in the order they were
//! registered, on the task that publishes. A panicking handler is logged and
//! skipped; the rest of the handlers for that frame still run. Frames are never
//! buffered: a handler registered after a publish does not see it.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// One discrete named message delivered over the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "event")]
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Frame {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, serde_json::Value::Null)
    }
}

type Handler = Arc<dyn Fn(&Frame) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, Handler)>>,
}

/// Shared handle to the registry. Cloning is cheap and every clone sees the
/// same subscriptions.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<RwLock<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, name: &str, handler: F) -> Subscription
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let mut registry = self.registry.write();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            id,
            name: name.to_string(),
            registry: Arc::downgrade(&self.registry),
            active: true,
        }
    }

    /// Registers a handler that receives the payload decoded as `T`.
    /// Payloads that fail to decode are dropped.
    pub fn on_typed<T, F>(&self, name: &str, handler: F) -> Subscription
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on(name, move |frame| {
            match serde_json::from_value::<T>(frame.payload.clone()) {
                Ok(decoded) => handler(decoded),
                Err(err) => {
                    debug!(
                        target: "frame_bus",
                        frame = %frame.name,
                        error = %err,
                        "dropping frame with malformed payload"
                    );
                }
            }
        })
    }

    /// Removes exactly this subscription. Returns false when it was already gone.
    pub fn off(&self, subscription: &Subscription) -> bool {
        remove(&self.registry, &subscription.name, subscription.id)
    }

    /// Delivers a frame to every current handler for `name` and returns how
    /// many handlers completed without panicking.
    pub fn publish(&self, name: &str, payload: serde_json::Value) -> usize {
        self.dispatch(&Frame::new(name, payload))
    }

    pub fn dispatch(&self, frame: &Frame) -> usize {
        // Snapshot the handler list so handlers may subscribe or unsubscribe
        // without deadlocking against the registry lock.
        let handlers: Vec<Handler> = {
            let registry = self.registry.read();
            match registry.handlers.get(&frame.name) {
                Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    let reason = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".into());
                    warn!(
                        target: "frame_bus",
                        frame = %frame.name,
                        reason = %reason,
                        "frame handler panicked"
                    );
                }
            }
        }
        delivered
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.registry
            .read()
            .handlers
            .get(name)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

fn remove(registry: &RwLock<Registry>, name: &str, id: u64) -> bool {
    let mut guard = registry.write();
    let Some(list) = guard.handlers.get_mut(name) else {
        return false;
    };
    let before = list.len();
    list.retain(|(entry_id, _)| *entry_id != id);
    let removed = list.len() != before;
    if list.is_empty() {
        guard.handlers.remove(name);
    }
    removed
}

/// Registration handle. Dropping it unsubscribes the handler.
#[must_use = "dropping a Subscription immediately unsubscribes its handler"]
pub struct Subscription {
    id: u64,
    name: String,
    registry: Weak<RwLock<Registry>>,
    active: bool,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unsubscribe(mut self) -> bool {
        self.release()
    }

    /// Keeps the handler registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        match self.registry.upgrade() {
            Some(registry) => remove(&registry, &self.name, self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("active", &self.active)
            .finish()
    }
}
