//! Names of the frames exchanged over the realtime channel.
//!
//! Server-pushed frames arrive as JSON text messages shaped
//! `{"event": "<name>", "payload": {...}}`. The lifecycle frames at the bottom
//! are emitted locally by the connection manager.

pub use frame_bus::Frame;

pub const PEER_JOINED: &str = "peer_joined";
pub const PEER_LEFT: &str = "peer_left";
pub const PEER_STATUS_CHANGED: &str = "peer_status_changed";
pub const MATCH_FOUND: &str = "match_found";
pub const INTRODUCTION_RECEIVED: &str = "introduction_received";
pub const MEETUP_SCHEDULED: &str = "meetup_scheduled";
pub const PROXIMITY_ALERT: &str = "proximity_alert";
pub const ACTIVITY_PING: &str = "activity_ping";
pub const TYPING_STARTED: &str = "typing_started";
pub const TYPING_STOPPED: &str = "typing_stopped";

pub const CONNECTED: &str = "connected";
pub const DISCONNECTED: &str = "disconnected";
pub const RECONNECTING: &str = "reconnecting";
pub const CONNECTION_GIVEN_UP: &str = "connection_given_up";
pub const CONNECTION_UNAUTHORIZED: &str = "connection_unauthorized";

/// Names the connection manager reserves for itself. Server frames carrying
/// one of them are dropped on receipt.
pub const LIFECYCLE_FRAMES: [&str; 5] = [
    CONNECTED,
    DISCONNECTED,
    RECONNECTING,
    CONNECTION_GIVEN_UP,
    CONNECTION_UNAUTHORIZED,
];

pub fn is_lifecycle(name: &str) -> bool {
    LIFECYCLE_FRAMES.contains(&name)
}
