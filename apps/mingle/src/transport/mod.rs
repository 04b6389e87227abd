//! Wire-level seams: the HTTP backend the request pipeline drives and the
//! dialer the connection manager uses for the realtime channel.

use async_trait::async_trait;
use bytes::Bytes;
use frame_bus::Frame;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod http;
pub mod mock;
pub mod websocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(format!("unsupported method '{other}'")),
        }
    }
}

/// One concrete attempt as handed to the backend. `path` is relative to the
/// API base and never starts with `/`.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
    pub bearer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decodes the body as JSON; an empty body decodes as `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return serde_json::from_value(serde_json::Value::Null);
        }
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportFailure {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    TimedOut,
    #[error("invalid request: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<Response, TransportFailure>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DialError {
    #[error("realtime handshake rejected the access token")]
    Unauthorized,
    #[error("realtime handshake failed: {0}")]
    Network(String),
}

/// An established realtime channel. Protocol-specific pumping happens in the
/// task owned by the channel; dropping the channel stops it.
#[derive(Debug)]
pub struct RealtimeChannel {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<Frame>,
    pump: Option<JoinHandle<()>>,
}

impl RealtimeChannel {
    pub fn new(
        outbound: mpsc::UnboundedSender<Frame>,
        inbound: mpsc::UnboundedReceiver<Frame>,
        pump: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            pump,
        }
    }

    /// An in-process channel plus the far end, used by mocks and tests.
    pub fn pair() -> (RealtimeChannel, ChannelPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            RealtimeChannel::new(outbound_tx, inbound_rx, None),
            ChannelPeer {
                to_client: inbound_tx,
                from_client: outbound_rx,
            },
        )
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Frame> {
        self.outbound.clone()
    }

    /// Next inbound frame, or `None` once the channel has dropped.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Server side of [`RealtimeChannel::pair`]. Dropping it looks like a network
/// drop to the client.
#[derive(Debug)]
pub struct ChannelPeer {
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl ChannelPeer {
    pub fn push(&self, name: &str, payload: serde_json::Value) -> bool {
        self.to_client.send(Frame::new(name, payload)).is_ok()
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.to_client.is_closed()
    }
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, access_token: &str) -> Result<RealtimeChannel, DialError>;
}
