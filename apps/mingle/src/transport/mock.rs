//! Scripted backends for tests and offline wiring.

use crate::transport::{
    ChannelPeer, DialError, Dialer, HttpBackend, Method, OutboundRequest, RealtimeChannel,
    Response, TransportFailure,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub enum MockReply {
    Status {
        status: u16,
        body: serde_json::Value,
        headers: Vec<(String, String)>,
    },
    Fail(TransportFailure),
    /// Never answers; exercises the per-attempt timeout.
    Hang,
    Delayed(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        MockReply::Status {
            status,
            body,
            headers: Vec::new(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self::json(status, serde_json::Value::Null)
    }

    pub fn network(message: &str) -> Self {
        MockReply::Fail(TransportFailure::Network(message.to_string()))
    }

    pub fn with_header(self, name: &str, value: &str) -> Self {
        match self {
            MockReply::Status {
                status,
                body,
                mut headers,
            } => {
                headers.push((name.to_string(), value.to_string()));
                MockReply::Status {
                    status,
                    body,
                    headers,
                }
            }
            other => other,
        }
    }

    pub fn after(self, delay: Duration) -> Self {
        MockReply::Delayed(delay, Box::new(self))
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: Option<serde_json::Value>,
    pub at: Instant,
}

type RouteHandler = Arc<dyn Fn(&OutboundRequest) -> MockReply + Send + Sync>;

#[derive(Default)]
struct Route {
    queue: VecDeque<MockReply>,
    handler: Option<RouteHandler>,
}

/// HTTP backend answering from per-route scripts. Queued replies are used
/// first, in order; after that the route handler answers; unknown routes get 404.
#[derive(Default)]
pub struct MockBackend {
    routes: Mutex<HashMap<(Method, String), Route>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueue(&self, method: Method, path: &str, reply: MockReply) {
        self.routes
            .lock()
            .entry((method, normalize(path)))
            .or_default()
            .queue
            .push_back(reply);
    }

    pub fn route<F>(&self, method: Method, path: &str, handler: F)
    where
        F: Fn(&OutboundRequest) -> MockReply + Send + Sync + 'static,
    {
        self.routes
            .lock()
            .entry((method, normalize(path)))
            .or_default()
            .handler = Some(Arc::new(handler));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<RecordedCall> {
        let path = normalize(path);
        self.calls
            .lock()
            .iter()
            .filter(|call| call.path == path)
            .cloned()
            .collect()
    }

    fn next_reply(&self, request: &OutboundRequest) -> MockReply {
        let mut routes = self.routes.lock();
        let Some(route) = routes.get_mut(&(request.method, request.path.clone())) else {
            return MockReply::status(404);
        };
        if let Some(reply) = route.queue.pop_front() {
            return reply;
        }
        match route.handler.clone() {
            Some(handler) => {
                drop(routes);
                handler(request)
            }
            None => MockReply::status(404),
        }
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

#[async_trait]
impl HttpBackend for MockBackend {
    async fn send(&self, request: OutboundRequest) -> Result<Response, TransportFailure> {
        self.calls.lock().push(RecordedCall {
            method: request.method,
            path: request.path.clone(),
            bearer: request.bearer.clone(),
            body: request.body.clone(),
            at: Instant::now(),
        });

        let mut reply = self.next_reply(&request);
        loop {
            match reply {
                MockReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                MockReply::Hang => return std::future::pending().await,
                MockReply::Fail(failure) => return Err(failure),
                MockReply::Status {
                    status,
                    body,
                    headers,
                } => {
                    let bytes = if body.is_null() {
                        Vec::new()
                    } else {
                        serde_json::to_vec(&body).unwrap_or_default()
                    };
                    return Ok(Response {
                        status,
                        headers,
                        body: bytes.into(),
                    });
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum MockDial {
    Accept,
    Refuse(DialError),
}

/// Dialer handing out in-process channels. Each accepted dial makes a
/// [`ChannelPeer`] available through [`MockDialer::next_peer`].
pub struct MockDialer {
    script: Mutex<VecDeque<MockDial>>,
    fallback: Mutex<MockDial>,
    dials: Mutex<Vec<(String, Instant)>>,
    peers_tx: mpsc::UnboundedSender<ChannelPeer>,
    peers_rx: AsyncMutex<mpsc::UnboundedReceiver<ChannelPeer>>,
}

impl MockDialer {
    pub fn new() -> Arc<Self> {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(MockDial::Accept),
            dials: Mutex::new(Vec::new()),
            peers_tx,
            peers_rx: AsyncMutex::new(peers_rx),
        })
    }

    pub fn enqueue(&self, outcome: MockDial) {
        self.script.lock().push_back(outcome);
    }

    /// Outcome used once the script is exhausted.
    pub fn set_fallback(&self, outcome: MockDial) {
        *self.fallback.lock() = outcome;
    }

    pub fn dial_count(&self) -> usize {
        self.dials.lock().len()
    }

    pub fn dial_times(&self) -> Vec<Instant> {
        self.dials.lock().iter().map(|(_, at)| *at).collect()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.dials.lock().iter().map(|(token, _)| token.clone()).collect()
    }

    pub async fn next_peer(&self) -> Option<ChannelPeer> {
        self.peers_rx.lock().await.recv().await
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, access_token: &str) -> Result<RealtimeChannel, DialError> {
        self.dials
            .lock()
            .push((access_token.to_string(), Instant::now()));
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone());
        match outcome {
            MockDial::Accept => {
                let (channel, peer) = RealtimeChannel::pair();
                let _ = self.peers_tx.send(peer);
                Ok(channel)
            }
            MockDial::Refuse(err) => Err(err),
        }
    }
}
