use crate::auth::credentials::{CredentialPair, CredentialStore};
use crate::auth::gate::SessionGateway;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("no refresh token is stored")]
    MissingRefreshToken,
    #[error("refresh failed: {0}")]
    Rejected(String),
}

type SharedRefresh = Shared<BoxFuture<'static, Result<CredentialPair, RefreshError>>>;

/// Serializes credential refreshes: while one is in flight, every caller
/// awaits the same outcome instead of issuing its own request.
pub struct RefreshCoordinator {
    gateway: SessionGateway,
    store: CredentialStore,
    inflight: Arc<Mutex<Option<(u64, SharedRefresh)>>>,
    next_id: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(gateway: SessionGateway, store: CredentialStore) -> Self {
        Self {
            gateway,
            store,
            inflight: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Joins the in-flight refresh or starts one. On success the store
    /// already holds the returned pair; on failure it has been cleared.
    pub async fn refresh(&self) -> Result<CredentialPair, RefreshError> {
        let shared = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some((_, pending)) => {
                    debug!(target: "mingle::auth", "joining in-flight refresh");
                    pending.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let pending = run(
                        self.gateway.clone(),
                        self.store.clone(),
                        Arc::clone(&self.inflight),
                        id,
                    )
                    .boxed()
                    .shared();
                    *slot = Some((id, pending.clone()));
                    pending
                }
            }
        };
        shared.await
    }
}

async fn run(
    gateway: SessionGateway,
    store: CredentialStore,
    inflight: Arc<Mutex<Option<(u64, SharedRefresh)>>>,
    id: u64,
) -> Result<CredentialPair, RefreshError> {
    let outcome = match store.refresh_token() {
        None => Err(RefreshError::MissingRefreshToken),
        Some(token) => gateway
            .refresh(&token)
            .await
            .map_err(|err| RefreshError::Rejected(err.to_string())),
    };

    match &outcome {
        Ok(pair) => {
            if let Err(err) = store.set(pair.clone()) {
                warn!(target: "mingle::auth", error = %err, "failed to persist refreshed credentials");
            }
            info!(target: "mingle::auth", "access token refreshed");
        }
        Err(err) => {
            warn!(target: "mingle::auth", error = %err, "refresh failed; clearing credentials");
            if let Err(err) = store.clear() {
                warn!(target: "mingle::auth", error = %err, "failed to clear persisted credentials");
            }
        }
    }

    let mut slot = inflight.lock();
    if slot.as_ref().map(|(current, _)| *current) == Some(id) {
        slot.take();
    }
    outcome
}
