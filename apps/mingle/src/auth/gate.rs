use crate::auth::credentials::CredentialPair;
use crate::auth::error::AuthError;
use crate::transport::{HttpBackend, Method, OutboundRequest, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Access-token lifetime assumed when the server omits `expiresIn`.
const DEFAULT_EXPIRES_IN: u64 = 15 * 60;

/// Talks to the session endpoints under the configured auth prefix.
///
/// These calls never carry a bearer token and never go through the request
/// pipeline, so a failing refresh cannot recurse into another refresh.
#[derive(Clone)]
pub struct SessionGateway {
    backend: Arc<dyn HttpBackend>,
    auth_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    #[serde(alias = "access_token")]
    pub access_token: String,
    #[serde(alias = "refresh_token")]
    pub refresh_token: String,
    #[serde(default, alias = "expires_in", alias = "accessTokenExpiresIn")]
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    pub fn into_pair(self) -> CredentialPair {
        CredentialPair::expiring_in(
            self.access_token,
            self.refresh_token,
            self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    #[serde(alias = "message")]
    detail: Option<String>,
}

impl SessionGateway {
    pub fn new(backend: Arc<dyn HttpBackend>, auth_prefix: impl Into<String>) -> Self {
        Self {
            backend,
            auth_prefix: auth_prefix.into(),
        }
    }

    fn path(&self, endpoint: &str) -> String {
        format!("{}{}", self.auth_prefix, endpoint)
    }

    async fn post(&self, endpoint: &str, body: serde_json::Value) -> Result<Response, AuthError> {
        let request = OutboundRequest {
            method: Method::Post,
            path: self.path(endpoint),
            body: Some(body),
            headers: Vec::new(),
            bearer: None,
        };
        Ok(self.backend.send(request).await?)
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair, AuthError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct RefreshRequest<'a> {
            refresh_token: &'a str,
        }

        let body = serde_json::to_value(RefreshRequest { refresh_token })
            .map_err(|err| AuthError::Decode(err.to_string()))?;
        let response = self.post("refresh", body).await?;
        if response.status == 401 || response.status == 403 {
            return Err(AuthError::Rejected);
        }
        token_pair(response, "token refresh")
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<CredentialPair, AuthError> {
        #[derive(Serialize)]
        struct LoginRequest<'a> {
            email: &'a str,
            password: &'a str,
        }

        let body = serde_json::to_value(LoginRequest { email, password })
            .map_err(|err| AuthError::Decode(err.to_string()))?;
        let response = self.post("login", body).await?;
        if response.status == 401 {
            return Err(AuthError::Rejected);
        }
        token_pair(response, "sign in")
    }

    /// Revokes the refresh token server-side. Failures are logged and
    /// otherwise ignored; local sign-out proceeds regardless.
    pub async fn logout(&self, refresh_token: &str) {
        let body = serde_json::json!({ "refreshToken": refresh_token });
        match self.post("logout", body).await {
            Ok(response) if response.is_success() => {
                debug!(target: "mingle::auth", "server session revoked");
            }
            Ok(response) => {
                warn!(target: "mingle::auth", status = response.status, "logout rejected by server");
            }
            Err(err) => {
                warn!(target: "mingle::auth", error = %err, "logout request failed");
            }
        }
    }
}

fn token_pair(response: Response, action: &str) -> Result<CredentialPair, AuthError> {
    if response.is_success() {
        let tokens: TokenResponse = response
            .json()
            .map_err(|err| AuthError::Decode(err.to_string()))?;
        return Ok(tokens.into_pair());
    }

    let text = response.text();
    let err_body: ErrorBody = serde_json::from_str(&text).unwrap_or(ErrorBody {
        error: None,
        detail: Some(text.clone()),
    });
    Err(AuthError::Gateway {
        status: response.status,
        detail: format!(
            "{action} failed: {}",
            err_body
                .detail
                .or(err_body.error)
                .filter(|detail| !detail.is_empty())
                .unwrap_or_else(|| "unknown error".into())
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::access_token_is_valid;
    use crate::transport::mock::{MockBackend, MockReply};
    use serde_json::json;

    #[tokio::test]
    async fn refresh_posts_token_without_bearer() {
        let backend = MockBackend::new();
        backend.enqueue(
            Method::Post,
            "auth/refresh",
            MockReply::json(
                200,
                json!({"accessToken": "a2", "refreshToken": "r2", "expiresIn": 900}),
            ),
        );
        let gateway = SessionGateway::new(backend.clone(), "auth/");

        let pair = gateway.refresh("r1").await.unwrap();
        assert_eq!(pair.access_token, "a2");
        assert_eq!(pair.refresh_token, "r2");
        assert!(access_token_is_valid(&pair));

        let calls = backend.calls_to("auth/refresh");
        assert_eq!(calls.len(), 1);
        assert!(calls[0].bearer.is_none());
        assert_eq!(calls[0].body, Some(json!({"refreshToken": "r1"})));
    }

    #[tokio::test]
    async fn refresh_rejection_and_gateway_errors() {
        let backend = MockBackend::new();
        backend.enqueue(Method::Post, "auth/refresh", MockReply::status(401));
        backend.enqueue(
            Method::Post,
            "auth/refresh",
            MockReply::json(500, json!({"error": "database unavailable"})),
        );
        let gateway = SessionGateway::new(backend, "auth/");

        assert!(matches!(gateway.refresh("r").await, Err(AuthError::Rejected)));
        match gateway.refresh("r").await {
            Err(AuthError::Gateway { status, detail }) => {
                assert_eq!(status, 500);
                assert!(detail.contains("database unavailable"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepts_snake_case_token_fields() {
        let backend = MockBackend::new();
        backend.enqueue(
            Method::Post,
            "auth/login",
            MockReply::json(200, json!({"access_token": "a", "refresh_token": "r"})),
        );
        let gateway = SessionGateway::new(backend, "auth/");
        let pair = gateway.sign_in("ada@example.com", "pw").await.unwrap();
        assert_eq!(pair.access_token, "a");
        assert!(access_token_is_valid(&pair));
    }

    #[tokio::test]
    async fn logout_swallows_failures() {
        let backend = MockBackend::new();
        backend.enqueue(Method::Post, "auth/logout", MockReply::network("reset"));
        let gateway = SessionGateway::new(backend.clone(), "auth/");
        gateway.logout("r").await;
        assert_eq!(backend.calls_to("auth/logout").len(), 1);
    }
}
