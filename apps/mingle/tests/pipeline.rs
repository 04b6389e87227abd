use mingle_client_core::auth::{CredentialPair, CredentialStore, RefreshCoordinator, SessionGateway};
use mingle_client_core::pipeline::{RequestDescriptor, RequestError, RequestPipeline, RetryPolicy};
use mingle_client_core::transport::Method;
use mingle_client_core::transport::mock::{MockBackend, MockReply};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn signed_in(backend: &Arc<MockBackend>) -> (RequestPipeline, CredentialStore) {
    let store = CredentialStore::in_memory();
    store
        .set(CredentialPair::expiring_in("a1", "r1", 600))
        .unwrap();
    let refresher = Arc::new(RefreshCoordinator::new(
        SessionGateway::new(backend.clone(), "auth/"),
        store.clone(),
    ));
    let pipeline = RequestPipeline::new(
        backend.clone(),
        store.clone(),
        refresher,
        RetryPolicy::default(),
        "auth/",
    );
    (pipeline, store)
}

/// Paused time advances in whole timer ticks.
fn assert_close(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual <= expected + Duration::from_millis(5),
        "expected about {expected:?}, got {actual:?}"
    );
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn server_errors_retry_with_growing_delays() {
    let backend = MockBackend::new();
    for _ in 0..3 {
        backend.enqueue(Method::Get, "matches", MockReply::status(500));
    }
    backend.enqueue(
        Method::Get,
        "matches",
        MockReply::json(200, json!([{"id": "m1"}])),
    );
    let (pipeline, _) = signed_in(&backend);

    let matches: serde_json::Value = pipeline
        .request_json(RequestDescriptor::get("matches"))
        .await
        .expect("resolves after retries");
    assert_eq!(matches[0]["id"], "m1");

    let times: Vec<_> = backend.calls().iter().map(|call| call.at).collect();
    assert_eq!(times.len(), 4);
    let gaps: Vec<Duration> = times.windows(2).map(|pair| pair[1] - pair[0]).collect();
    for (gap, expected) in gaps.iter().zip([500u64, 1_000, 2_000]) {
        assert_close(*gap, Duration::from_millis(expected));
    }
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn persistent_server_errors_exhaust_retries() {
    let backend = MockBackend::new();
    backend.route(Method::Get, "matches", |_| {
        MockReply::json(503, json!({"error": "maintenance"}))
    });
    let (pipeline, _) = signed_in(&backend);

    let err = pipeline
        .request(RequestDescriptor::get("matches"))
        .await
        .unwrap_err();
    match err {
        RequestError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 4);
            assert!(matches!(*last, RequestError::Server { status: 503, .. }));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(backend.calls().len(), 4);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn dropped_connections_retry_with_backoff() {
    let backend = MockBackend::new();
    backend.enqueue(Method::Get, "profile", MockReply::network("connection reset"));
    backend.enqueue(Method::Get, "profile", MockReply::network("connection reset"));
    backend.enqueue(
        Method::Get,
        "profile",
        MockReply::json(200, json!({"name": "Ada"})),
    );
    let (pipeline, _) = signed_in(&backend);

    let profile: serde_json::Value = pipeline
        .request_json(RequestDescriptor::get("profile"))
        .await
        .expect("third attempt succeeds");
    assert_eq!(profile["name"], "Ada");

    let times: Vec<_> = backend.calls().iter().map(|call| call.at).collect();
    assert_eq!(times.len(), 3);
    assert_close(times[1] - times[0], Duration::from_millis(500));
    assert_close(times[2] - times[1], Duration::from_millis(1_000));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn persistent_network_failure_exhausts_retries() {
    let backend = MockBackend::new();
    backend.route(Method::Get, "profile", |_| {
        MockReply::network("connection refused")
    });
    let (pipeline, _) = signed_in(&backend);

    let err = pipeline
        .request(RequestDescriptor::get("profile"))
        .await
        .unwrap_err();
    match err {
        RequestError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 4);
            assert!(matches!(
                *last,
                RequestError::Transient {
                    timed_out: false,
                    ..
                }
            ));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(backend.calls().len(), 4);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn rate_limit_is_terminal() {
    let backend = MockBackend::new();
    backend.enqueue(
        Method::Post,
        "introductions",
        MockReply::status(429).with_header("Retry-After", "30"),
    );
    let (pipeline, _) = signed_in(&backend);

    let err = pipeline
        .request(RequestDescriptor::post("introductions", json!({"to": "p2"})))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RequestError::RateLimited {
            retry_after: Some(Duration::from_secs(30))
        }
    );
    assert_eq!(backend.calls().len(), 1);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn concurrent_unauthorized_requests_share_one_refresh() {
    let backend = MockBackend::new();
    backend.route(Method::Get, "feed", |request| {
        if request.bearer.as_deref() == Some("a2") {
            MockReply::json(200, json!({"items": []}))
        } else {
            MockReply::status(401)
        }
    });
    backend.enqueue(
        Method::Post,
        "auth/refresh",
        MockReply::json(200, json!({"accessToken": "a2", "refreshToken": "r2"}))
            .after(Duration::from_millis(100)),
    );
    let (pipeline, store) = signed_in(&backend);

    let (first, second) = tokio::join!(
        pipeline.request(RequestDescriptor::get("feed")),
        pipeline.request(RequestDescriptor::get("feed")),
    );
    assert_eq!(first.expect("first replayed").status, 200);
    assert_eq!(second.expect("second replayed").status, 200);

    assert_eq!(backend.calls_to("auth/refresh").len(), 1);
    let feed_tokens: Vec<_> = backend
        .calls_to("feed")
        .into_iter()
        .map(|call| call.bearer.unwrap_or_default())
        .collect();
    assert_eq!(feed_tokens, ["a1", "a1", "a2", "a2"]);
    assert_eq!(store.access_token().as_deref(), Some("a2"));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn failed_refresh_expires_every_waiting_request() {
    let backend = MockBackend::new();
    backend.route(Method::Get, "feed", |_| MockReply::status(401));
    backend.enqueue(
        Method::Post,
        "auth/refresh",
        MockReply::json(401, json!({"error": "refresh token revoked"}))
            .after(Duration::from_millis(100)),
    );
    let (pipeline, store) = signed_in(&backend);

    let (first, second) = tokio::join!(
        pipeline.request(RequestDescriptor::get("feed")),
        pipeline.request(RequestDescriptor::get("feed")),
    );
    assert_eq!(first.unwrap_err(), RequestError::SessionExpired);
    assert_eq!(second.unwrap_err(), RequestError::SessionExpired);
    assert_eq!(backend.calls_to("auth/refresh").len(), 1);
    assert!(store.get().is_none());
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn second_unauthorized_after_refresh_is_terminal() {
    let backend = MockBackend::new();
    backend.route(Method::Get, "admin", |_| MockReply::status(401));
    backend.enqueue(
        Method::Post,
        "auth/refresh",
        MockReply::json(200, json!({"accessToken": "a2", "refreshToken": "r2"})),
    );
    let (pipeline, store) = signed_in(&backend);

    let err = pipeline
        .request(RequestDescriptor::get("admin"))
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Client { status: 401, .. }));
    assert_eq!(backend.calls_to("admin").len(), 2);
    assert_eq!(backend.calls_to("auth/refresh").len(), 1);
    assert!(store.get().is_some());
}

#[test_timeout::tokio_timeout_test(60, paused)]
async fn hung_attempt_times_out_and_retries() {
    let backend = MockBackend::new();
    backend.enqueue(Method::Get, "profile", MockReply::Hang);
    backend.enqueue(Method::Get, "profile", MockReply::json(200, json!({"name": "Ada"})));
    let (pipeline, _) = signed_in(&backend);

    let started = tokio::time::Instant::now();
    let response = pipeline
        .request(RequestDescriptor::get("profile"))
        .await
        .expect("second attempt succeeds");
    assert_eq!(response.status, 200);
    assert_close(
        started.elapsed(),
        RetryPolicy::default().attempt_timeout + RetryPolicy::default().base_delay,
    );
}
