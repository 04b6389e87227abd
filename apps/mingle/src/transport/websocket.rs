use crate::transport::{DialError, Dialer, RealtimeChannel};
use async_trait::async_trait;
use frame_bus::Frame;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

/// Dials the realtime endpoint over WebSocket, presenting the access token
/// as a bearer `Authorization` header on the upgrade request.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    url: Url,
    handshake_timeout: Duration,
}

impl WebSocketDialer {
    pub fn new(url: Url, handshake_timeout: Duration) -> Self {
        Self {
            url,
            handshake_timeout,
        }
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, access_token: &str) -> Result<RealtimeChannel, DialError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| DialError::Network(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {access_token}"))
            .map_err(|err| DialError::Network(format!("invalid access token header: {err}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let stream = match tokio::time::timeout(self.handshake_timeout, connect_async(request)).await {
            Err(_) => return Err(DialError::Network("handshake timed out".into())),
            Ok(Err(tungstenite::Error::Http(response)))
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                return Err(DialError::Unauthorized);
            }
            Ok(Err(err)) => return Err(DialError::Network(err.to_string())),
            Ok(Ok((stream, _))) => stream,
        };
        debug!(target: "mingle::transport", url = %self.url, "websocket established");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_websocket(stream, outbound_rx, inbound_tx));
        Ok(RealtimeChannel::new(outbound_tx, inbound_rx, Some(pump)))
    }
}

async fn pump_websocket(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::UnboundedSender<Frame>,
) {
    let (mut ws_sender, mut ws_receiver) = stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!(target: "mingle::transport", frame = %frame.name, error = %err, "failed to encode outbound frame");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => {
                    if inbound.send(frame).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    trace!(target: "mingle::transport", error = %err, "ignoring undecodable text message");
                }
            },
            Ok(Message::Close(reason)) => {
                debug!(target: "mingle::transport", ?reason, "server closed websocket");
                break;
            }
            Err(err) => {
                debug!(target: "mingle::transport", error = %err, "websocket read failed");
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
}
