use crate::config::ConfigError;
use crate::transport::{HttpBackend, Method, OutboundRequest, Response, TransportFailure};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::trace;
use url::Url;

#[derive(Debug, Clone)]
pub struct ReqwestBackend {
    client: Client,
    base: Url,
}

impl ReqwestBackend {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ConfigError::Invalid {
                var: "http client",
                reason: err.to_string(),
            })?;
        Ok(Self { client, base })
    }

    fn url(&self, path: &str) -> Result<Url, TransportFailure> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|err| TransportFailure::Invalid(format!("invalid request path '{path}': {err}")))
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn send(&self, request: OutboundRequest) -> Result<Response, TransportFailure> {
        let url = self.url(&request.path)?;
        trace!(target: "mingle::transport", method = %request.method, url = %url, "sending request");

        let mut builder = self.client.request(request.method.into(), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = request.bearer.as_deref() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(classify)?;

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

fn classify(err: reqwest::Error) -> TransportFailure {
    if err.is_timeout() {
        TransportFailure::TimedOut
    } else if err.is_builder() {
        TransportFailure::Invalid(err.to_string())
    } else {
        TransportFailure::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_relative_and_rooted_paths() {
        let backend = ReqwestBackend::new(
            Url::parse("http://127.0.0.1:8080/api/").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            backend.url("/profiles/me").unwrap().as_str(),
            "http://127.0.0.1:8080/api/profiles/me"
        );
        assert_eq!(
            backend.url("auth/refresh").unwrap().as_str(),
            "http://127.0.0.1:8080/api/auth/refresh"
        );
    }
}
