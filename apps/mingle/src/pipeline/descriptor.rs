use crate::transport::{Method, OutboundRequest};
use serde_json::Value;

/// A logical API request. The pipeline owns the retry bookkeeping; callers
/// only fill in method, path, body and headers.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub retry_count: u32,
    pub is_post_refresh_retry: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
            retry_count: 0,
            is_post_refresh_retry: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Patch, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub(crate) fn outbound(&self, bearer: Option<String>) -> OutboundRequest {
        OutboundRequest {
            method: self.method,
            path: self.path.trim_start_matches('/').to_string(),
            body: self.body.clone(),
            headers: self.headers.clone(),
            bearer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_strips_leading_slash() {
        let descriptor = RequestDescriptor::post("/matches/42/accept", json!({"note": "hi"}))
            .with_header("X-Request-Source", "tests");
        let outbound = descriptor.outbound(Some("tok".into()));
        assert_eq!(outbound.path, "matches/42/accept");
        assert_eq!(outbound.method, Method::Post);
        assert_eq!(outbound.bearer.as_deref(), Some("tok"));
        assert_eq!(outbound.headers.len(), 1);
        assert_eq!(descriptor.retry_count, 0);
        assert!(!descriptor.is_post_refresh_retry);
    }
}
