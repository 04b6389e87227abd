pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod pipeline;
pub mod presence;
pub mod protocol;
pub mod telemetry;
pub mod timer;
pub mod transport;

pub use client::{ClientError, ClientSnapshot, MingleClient, RestoreOutcome};
pub use frame_bus::{EventBus, Frame, Subscription};
