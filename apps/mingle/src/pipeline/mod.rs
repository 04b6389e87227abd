//! Authenticated API requests with bounded retries and coordinated
//! credential refresh.

mod descriptor;
mod error;

pub use descriptor::RequestDescriptor;
pub use error::RequestError;

use crate::auth::{CredentialStore, RefreshCoordinator};
use crate::timer::exponential_backoff;
use crate::transport::{HttpBackend, Response, TransportFailure};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt for 5xx and network failures.
    pub max_retries: u32,
    /// Delay before retry `n` (zero-based) is `base_delay * 2^n`.
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

pub struct RequestPipeline {
    backend: Arc<dyn HttpBackend>,
    store: CredentialStore,
    refresher: Arc<RefreshCoordinator>,
    policy: RetryPolicy,
    auth_prefix: String,
}

impl RequestPipeline {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        store: CredentialStore,
        refresher: Arc<RefreshCoordinator>,
        policy: RetryPolicy,
        auth_prefix: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            store,
            refresher,
            policy,
            auth_prefix: auth_prefix.into(),
        }
    }

    pub async fn request(&self, descriptor: RequestDescriptor) -> Result<Response, RequestError> {
        let mut descriptor = descriptor;
        if descriptor.path.trim_start_matches('/').trim().is_empty() {
            return Err(RequestError::InvalidRequest("request path is empty".into()));
        }

        loop {
            let bearer = self.store.access_token();
            let outbound = descriptor.outbound(bearer.clone());
            trace!(
                target: "mingle::pipeline",
                method = %descriptor.method,
                path = %outbound.path,
                retry = descriptor.retry_count,
                post_refresh = descriptor.is_post_refresh_retry,
                "sending request"
            );

            let outcome =
                match tokio::time::timeout(self.policy.attempt_timeout, self.backend.send(outbound))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportFailure::TimedOut),
                };

            let failure = match outcome {
                Ok(response) if response.is_success() => {
                    debug!(
                        target: "mingle::pipeline",
                        method = %descriptor.method,
                        path = %descriptor.path,
                        status = response.status,
                        "request succeeded"
                    );
                    return Ok(response);
                }
                Ok(response) => match response.status {
                    429 => {
                        let retry_after = retry_after(&response);
                        warn!(
                            target: "mingle::pipeline",
                            path = %descriptor.path,
                            ?retry_after,
                            "rate limited"
                        );
                        return Err(RequestError::RateLimited { retry_after });
                    }
                    401 if !descriptor.is_post_refresh_retry
                        && !crate::config::is_auth_path(&self.auth_prefix, &descriptor.path) =>
                    {
                        self.recover_session(bearer.as_deref()).await?;
                        descriptor.is_post_refresh_retry = true;
                        continue;
                    }
                    status if status >= 500 => RequestError::Server {
                        status,
                        body: response.text(),
                    },
                    status => {
                        debug!(
                            target: "mingle::pipeline",
                            path = %descriptor.path,
                            status,
                            "request rejected"
                        );
                        return Err(RequestError::Client {
                            status,
                            body: response.text(),
                        });
                    }
                },
                Err(TransportFailure::Invalid(reason)) => {
                    return Err(RequestError::InvalidRequest(reason));
                }
                Err(failure) => RequestError::Transient {
                    timed_out: failure == TransportFailure::TimedOut,
                    message: failure.to_string(),
                },
            };

            if descriptor.retry_count >= self.policy.max_retries {
                warn!(
                    target: "mingle::pipeline",
                    path = %descriptor.path,
                    attempts = descriptor.retry_count + 1,
                    error = %failure,
                    "giving up on request"
                );
                if self.policy.max_retries == 0 && matches!(failure, RequestError::Transient { .. })
                {
                    return Err(failure);
                }
                return Err(RequestError::RetriesExhausted {
                    attempts: descriptor.retry_count + 1,
                    last: Box::new(failure),
                });
            }

            let delay = exponential_backoff(self.policy.base_delay, descriptor.retry_count);
            debug!(
                target: "mingle::pipeline",
                path = %descriptor.path,
                retry = descriptor.retry_count + 1,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying request"
            );
            tokio::time::sleep(delay).await;
            descriptor.retry_count += 1;
        }
    }

    /// Sends the request and decodes a successful body as JSON.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<T, RequestError> {
        let response = self.request(descriptor).await?;
        response
            .json()
            .map_err(|err| RequestError::Decode(err.to_string()))
    }

    /// Makes fresh credentials available after a 401 on `used_token`.
    async fn recover_session(&self, used_token: Option<&str>) -> Result<(), RequestError> {
        let current = self.store.access_token();
        if current.is_some() && current.as_deref() != used_token {
            debug!(target: "mingle::pipeline", "access token rotated since send; replaying");
            return Ok(());
        }
        match self.refresher.refresh().await {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(target: "mingle::pipeline", error = %err, "session could not be refreshed");
                Err(RequestError::SessionExpired)
            }
        }
    }
}

/// `Retry-After` in delta-seconds form.
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .header("retry-after")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialPair, SessionGateway};
    use crate::transport::Method;
    use crate::transport::mock::{MockBackend, MockReply};
    use serde_json::json;

    fn pipeline(backend: Arc<MockBackend>, policy: RetryPolicy) -> (RequestPipeline, CredentialStore) {
        let store = CredentialStore::in_memory();
        store
            .set(CredentialPair::expiring_in("a1", "r1", 600))
            .unwrap();
        let refresher = Arc::new(RefreshCoordinator::new(
            SessionGateway::new(backend.clone(), "auth/"),
            store.clone(),
        ));
        (
            RequestPipeline::new(backend, store.clone(), refresher, policy, "auth/"),
            store,
        )
    }

    #[test]
    fn parses_retry_after_seconds() {
        let mut response = Response::new(429, "");
        assert_eq!(retry_after(&response), None);
        response.headers.push(("Retry-After".into(), " 7 ".into()));
        assert_eq!(retry_after(&response), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn attaches_bearer_and_decodes_json() {
        let backend = MockBackend::new();
        backend.enqueue(
            Method::Get,
            "profiles/me",
            MockReply::json(200, json!({"name": "Ada"})),
        );
        let (pipeline, _) = pipeline(backend.clone(), RetryPolicy::default());

        let profile: serde_json::Value = pipeline
            .request_json(RequestDescriptor::get("/profiles/me"))
            .await
            .unwrap();
        assert_eq!(profile["name"], "Ada");
        assert_eq!(backend.calls()[0].bearer.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn client_errors_are_terminal() {
        let backend = MockBackend::new();
        backend.enqueue(
            Method::Delete,
            "matches/9",
            MockReply::json(404, json!({"error": "gone"})),
        );
        let (pipeline, _) = pipeline(backend.clone(), RetryPolicy::default());

        let err = pipeline
            .request(RequestDescriptor::delete("matches/9"))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Client { status: 404, .. }));
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn unauthorized_on_auth_path_does_not_refresh() {
        let backend = MockBackend::new();
        backend.enqueue(Method::Post, "auth/login", MockReply::status(401));
        let (pipeline, store) = pipeline(backend.clone(), RetryPolicy::default());

        let err = pipeline
            .request(RequestDescriptor::post("auth/login", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Client { status: 401, .. }));
        assert!(backend.calls_to("auth/refresh").is_empty());
        assert!(store.is_signed_in());
    }

    #[tokio::test]
    async fn network_failure_without_retries_is_transient() {
        let backend = MockBackend::new();
        backend.enqueue(Method::Get, "feed", MockReply::network("connection refused"));
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        let (pipeline, _) = pipeline(backend, policy);

        let err = pipeline
            .request(RequestDescriptor::get("feed"))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Transient { timed_out: false, .. }));
    }

    #[tokio::test]
    async fn empty_path_is_rejected_locally() {
        let backend = MockBackend::new();
        let (pipeline, _) = pipeline(backend.clone(), RetryPolicy::default());
        let err = pipeline
            .request(RequestDescriptor::get("/"))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidRequest(_)));
        assert!(backend.calls().is_empty());
    }
}
