use crate::auth::{
    self, AuthError, CredentialPair, CredentialPersistence, CredentialStore, RefreshCoordinator,
    SessionGateway, access_token_is_valid,
};
use crate::config::{ClientConfig, ConfigError};
use crate::connection::{ConnectionError, ConnectionManager, ConnectionState};
use crate::pipeline::{RequestDescriptor, RequestError, RequestPipeline};
use crate::presence::{PresenceView, Reconciler};
use crate::transport::http::ReqwestBackend;
use crate::transport::websocket::WebSocketDialer;
use crate::transport::{Dialer, HttpBackend, Response};
use frame_bus::{EventBus, Frame, Subscription};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSnapshot {
    pub connection: ConnectionState,
    pub presence: PresenceView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Nothing was persisted.
    SignedOut,
    /// A persisted session existed but could not be renewed; it is gone now.
    Expired,
    /// Credentials are valid and the realtime channel is connected or
    /// reconnecting.
    Resumed,
}

/// Everything a signed-in app needs: authenticated requests, the realtime
/// channel and the reconciled presence state.
pub struct MingleClient {
    config: ClientConfig,
    store: CredentialStore,
    gateway: SessionGateway,
    refresher: Arc<RefreshCoordinator>,
    pipeline: RequestPipeline,
    bus: EventBus,
    connection: ConnectionManager,
    presence: Reconciler,
}

impl MingleClient {
    /// Wires the reqwest backend, the WebSocket dialer and file persistence.
    pub fn from_config(config: ClientConfig) -> Result<Self, ClientError> {
        let backend = Arc::new(ReqwestBackend::new(
            config.api_base.clone(),
            config.retry.attempt_timeout,
        )?);
        let dialer = Arc::new(WebSocketDialer::new(
            config.realtime_url.clone(),
            config.handshake_timeout,
        ));
        let persistence = auth::file_persistence(&config)?;
        Self::with_parts(config, backend, dialer, persistence)
    }

    pub fn with_parts(
        config: ClientConfig,
        backend: Arc<dyn HttpBackend>,
        dialer: Arc<dyn Dialer>,
        persistence: Arc<dyn CredentialPersistence>,
    ) -> Result<Self, ClientError> {
        let store = CredentialStore::load(persistence)?;
        let gateway = SessionGateway::new(Arc::clone(&backend), config.auth_prefix.clone());
        let refresher = Arc::new(RefreshCoordinator::new(gateway.clone(), store.clone()));
        let pipeline = RequestPipeline::new(
            backend,
            store.clone(),
            Arc::clone(&refresher),
            config.retry.clone(),
            config.auth_prefix.clone(),
        );
        let bus = EventBus::new();
        let connection = ConnectionManager::with_refresher(
            dialer,
            store.clone(),
            bus.clone(),
            config.reconnect.clone(),
            Arc::clone(&refresher),
        );
        let presence = Reconciler::attach(&bus, config.presence.clone());

        Ok(Self {
            config,
            store,
            gateway,
            refresher,
            pipeline,
            bus,
            connection,
            presence,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.store
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn presence(&self) -> &Reconciler {
        &self.presence
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn request(&self, descriptor: RequestDescriptor) -> Result<Response, RequestError> {
        let result = self.pipeline.request(descriptor).await;
        if matches!(result, Err(RequestError::SessionExpired)) {
            self.end_session();
        }
        result
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<T, RequestError> {
        let response = self.request(descriptor).await?;
        response
            .json()
            .map_err(|err| RequestError::Decode(err.to_string()))
    }

    pub fn subscribe<F>(&self, name: &str, handler: F) -> Subscription
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.bus.on(name, handler)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.bus.off(subscription)
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            connection: self.connection.state(),
            presence: self.presence.view(),
        }
    }

    pub fn watch_presence(&self) -> watch::Receiver<PresenceView> {
        self.presence.watch()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.connection.connect().await
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.connection.send(frame)
    }

    /// Signs in with email and password, then opens the realtime channel.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(), ClientError> {
        let pair = self.gateway.sign_in(email, password).await?;
        self.adopt_credentials(pair).await
    }

    /// Stores a pair obtained elsewhere and opens the realtime channel.
    /// A channel that fails for network reasons keeps reconnecting in the
    /// background and is not reported as an error here.
    pub async fn adopt_credentials(&self, pair: CredentialPair) -> Result<(), ClientError> {
        self.store.set(pair)?;
        info!(target: "mingle::auth", "signed in");
        match self.connection.connect().await {
            Ok(()) | Err(ConnectionError::Network(_)) | Err(ConnectionError::Superseded) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Silently resumes a persisted session at startup.
    pub async fn restore(&self) -> Result<RestoreOutcome, ClientError> {
        let Some(pair) = self.store.get() else {
            return Ok(RestoreOutcome::SignedOut);
        };

        if !access_token_is_valid(&pair) {
            debug!(target: "mingle::auth", "persisted access token expired; refreshing");
            if let Err(err) = self.refresher.refresh().await {
                warn!(target: "mingle::auth", error = %err, "could not resume session");
                self.end_session();
                return Ok(RestoreOutcome::Expired);
            }
        }

        match self.connection.connect().await {
            Ok(()) | Err(ConnectionError::Network(_)) | Err(ConnectionError::Superseded) => {}
            Err(ConnectionError::Unauthorized) => {
                // The server may have revoked the access token early.
                if self.refresher.refresh().await.is_err() {
                    self.end_session();
                    return Ok(RestoreOutcome::Expired);
                }
                match self.connection.connect().await {
                    Ok(()) | Err(ConnectionError::Network(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        }
        info!(target: "mingle::auth", "session resumed");
        Ok(RestoreOutcome::Resumed)
    }

    /// Revokes the session server-side when possible, then forgets it locally.
    pub async fn logout(&self) -> Result<(), ClientError> {
        if let Some(refresh_token) = self.store.refresh_token() {
            self.gateway.logout(&refresh_token).await;
        }
        self.connection.disconnect();
        self.presence.reset();
        self.store.clear()?;
        info!(target: "mingle::auth", "signed out");
        Ok(())
    }

    fn end_session(&self) {
        warn!(target: "mingle::auth", "session expired; closing realtime channel");
        self.connection.disconnect();
        self.presence.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryPersistence;
    use crate::transport::mock::{MockBackend, MockDial, MockDialer, MockReply};
    use crate::transport::{DialError, Method};
    use serde_json::json;
    use url::Url;

    fn config() -> ClientConfig {
        ClientConfig::new(
            Url::parse("http://api.mingle.test/v1/").unwrap(),
            Url::parse("ws://api.mingle.test/realtime").unwrap(),
        )
    }

    fn client(
        persistence: Arc<MemoryPersistence>,
    ) -> (MingleClient, Arc<MockBackend>, Arc<MockDialer>) {
        let backend = MockBackend::new();
        let dialer = MockDialer::new();
        let client =
            MingleClient::with_parts(config(), backend.clone(), dialer.clone(), persistence)
                .unwrap();
        (client, backend, dialer)
    }

    #[tokio::test]
    async fn restore_without_session_is_signed_out() {
        let (client, _, dialer) = client(MemoryPersistence::new());
        assert_eq!(client.restore().await.unwrap(), RestoreOutcome::SignedOut);
        assert_eq!(dialer.dial_count(), 0);
    }

    #[tokio::test]
    async fn restore_refreshes_expired_token_before_connecting() {
        let stale = CredentialPair::expiring_in("old", "r1", 0);
        let (client, backend, dialer) = client(MemoryPersistence::seeded(stale));
        backend.enqueue(
            Method::Post,
            "auth/refresh",
            MockReply::json(200, json!({"accessToken": "new", "refreshToken": "r2"})),
        );

        assert_eq!(client.restore().await.unwrap(), RestoreOutcome::Resumed);
        assert_eq!(dialer.tokens(), vec!["new".to_string()]);
        assert_eq!(client.snapshot().connection, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn restore_with_rejected_refresh_expires() {
        let persistence = MemoryPersistence::seeded(CredentialPair::expiring_in("old", "r1", 0));
        let (client, backend, dialer) = client(persistence.clone());
        backend.enqueue(Method::Post, "auth/refresh", MockReply::status(401));

        assert_eq!(client.restore().await.unwrap(), RestoreOutcome::Expired);
        assert_eq!(dialer.dial_count(), 0);
        assert!(persistence.persisted().is_none());
    }

    #[tokio::test]
    async fn restore_retries_once_after_unauthorized_handshake() {
        let pair = CredentialPair::expiring_in("revoked", "r1", 600);
        let (client, backend, dialer) = client(MemoryPersistence::seeded(pair));
        dialer.enqueue(MockDial::Refuse(DialError::Unauthorized));
        backend.enqueue(
            Method::Post,
            "auth/refresh",
            MockReply::json(200, json!({"accessToken": "fresh", "refreshToken": "r2"})),
        );

        assert_eq!(client.restore().await.unwrap(), RestoreOutcome::Resumed);
        assert_eq!(dialer.tokens(), vec!["revoked".to_string(), "fresh".to_string()]);
    }

    #[tokio::test]
    async fn sign_in_then_logout() {
        let persistence = MemoryPersistence::new();
        let (client, backend, dialer) = client(persistence.clone());
        backend.enqueue(
            Method::Post,
            "auth/login",
            MockReply::json(200, json!({"accessToken": "a", "refreshToken": "r"})),
        );
        backend.enqueue(Method::Post, "auth/logout", MockReply::status(204));

        client.sign_in("ada@example.com", "secret").await.unwrap();
        assert!(persistence.persisted().is_some());
        assert!(client.connection().is_connected());
        let peer = dialer.next_peer().await.unwrap();
        peer.push("peer_joined", json!({"peerId": "p1"}));
        tokio::task::yield_now().await;

        client.logout().await.unwrap();
        assert!(persistence.persisted().is_none());
        let snapshot = client.snapshot();
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);
        assert_eq!(snapshot.presence, PresenceView::default());
        assert_eq!(
            backend.calls_to("auth/logout")[0].body,
            Some(json!({"refreshToken": "r"}))
        );
    }

    #[tokio::test]
    async fn wrong_password_surfaces_rejection() {
        let (client, backend, _) = client(MemoryPersistence::new());
        backend.enqueue(Method::Post, "auth/login", MockReply::status(401));
        let err = client.sign_in("ada@example.com", "nope").await.unwrap_err();
        assert!(matches!(err, ClientError::Auth(AuthError::Rejected)));
        assert!(!client.credentials().is_signed_in());
    }

    #[tokio::test]
    async fn session_expiry_tears_down_realtime_state() {
        let pair = CredentialPair::expiring_in("a", "r", 600);
        let (client, backend, _dialer) = client(MemoryPersistence::seeded(pair));
        client.connect().await.unwrap();
        backend.enqueue(Method::Get, "feed", MockReply::status(401));
        backend.enqueue(Method::Post, "auth/refresh", MockReply::status(401));

        let err = client
            .request(RequestDescriptor::get("feed"))
            .await
            .unwrap_err();
        assert_eq!(err, RequestError::SessionExpired);
        assert_eq!(client.snapshot().connection, ConnectionState::Disconnected);
        assert!(!client.credentials().is_signed_in());
    }
}
