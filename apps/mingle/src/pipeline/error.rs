use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// Network failure or per-attempt timeout.
    #[error("network error: {message}")]
    Transient { message: String, timed_out: bool },
    #[error("server error ({status})")]
    Server { status: u16, body: String },
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<RequestError>,
    },
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("session expired")]
    SessionExpired,
    #[error("request rejected ({status})")]
    Client { status: u16, body: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("could not decode response: {0}")]
    Decode(String),
}

impl RequestError {
    /// Text suitable for showing to the person using the app.
    pub fn user_message(&self) -> String {
        match self {
            RequestError::Transient { timed_out: true, .. } => {
                "The server took too long to respond. Check your connection and try again.".into()
            }
            RequestError::Transient { .. } => {
                "You appear to be offline. Check your connection and try again.".into()
            }
            RequestError::Server { .. } => {
                "Something went wrong on our side. Please try again shortly.".into()
            }
            RequestError::RetriesExhausted { last, .. } => match last.as_ref() {
                RequestError::Server { .. } => {
                    "Mingle is having trouble right now. Please try again in a few minutes.".into()
                }
                other => other.user_message(),
            },
            RequestError::RateLimited {
                retry_after: Some(wait),
            } => format!(
                "You're doing that too often. Try again in {} seconds.",
                wait.as_secs().max(1)
            ),
            RequestError::RateLimited { retry_after: None } => {
                "You're doing that too often. Please wait a moment and try again.".into()
            }
            RequestError::SessionExpired => "Your session has expired. Please sign in again.".into(),
            RequestError::Client { status: 403, .. } => {
                "You don't have permission to do that.".into()
            }
            RequestError::Client { status: 404, .. } => "That item no longer exists.".into(),
            RequestError::Client { status: 409, .. } => {
                "That changed in the meantime. Refresh and try again.".into()
            }
            RequestError::Client { .. } => "The request could not be completed.".into(),
            RequestError::InvalidRequest(_) | RequestError::Decode(_) => {
                "Something unexpected happened. Please update the app or try again.".into()
            }
        }
    }

    /// HTTP status behind the error, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Server { status, .. } | RequestError::Client { status, .. } => {
                Some(*status)
            }
            RequestError::RateLimited { .. } => Some(429),
            RequestError::SessionExpired => Some(401),
            RequestError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Whether the failure of a single attempt warrants another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RequestError::Transient { .. } | RequestError::Server { .. }
        )
    }
}
