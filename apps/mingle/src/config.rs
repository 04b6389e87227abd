use crate::connection::ReconnectPolicy;
use crate::pipeline::RetryPolicy;
use crate::presence::PresenceConfig;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/api/";
const DEFAULT_REALTIME_URL: &str = "ws://127.0.0.1:8080/realtime";
const DEFAULT_AUTH_PREFIX: &str = "auth/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Client configuration, normally read from `MINGLE_*` environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base for request paths. Always ends with `/`.
    pub api_base: Url,
    pub realtime_url: Url,
    /// Path prefix of the session endpoints, relative to `api_base`.
    pub auth_prefix: String,
    /// Overrides `~/.mingle/credentials`.
    pub credentials_path: Option<PathBuf>,
    pub handshake_timeout: Duration,
    pub retry: RetryPolicy,
    pub reconnect: ReconnectPolicy,
    pub presence: PresenceConfig,
}

impl ClientConfig {
    pub fn new(api_base: Url, realtime_url: Url) -> Self {
        let mut api_base = api_base;
        if !api_base.path().ends_with('/') {
            let path = format!("{}/", api_base.path());
            api_base.set_path(&path);
        }
        Self {
            api_base,
            realtime_url,
            auth_prefix: DEFAULT_AUTH_PREFIX.to_string(),
            credentials_path: None,
            handshake_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            presence: PresenceConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let api_raw = env_string("MINGLE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let realtime_raw =
            env_string("MINGLE_REALTIME_URL").unwrap_or_else(|| DEFAULT_REALTIME_URL.to_string());
        let realtime_url = Url::parse(realtime_raw.trim()).map_err(|err| ConfigError::Invalid {
            var: "MINGLE_REALTIME_URL",
            reason: err.to_string(),
        })?;
        let mut config = ClientConfig::new(parse_url("MINGLE_API_URL", &api_raw)?, realtime_url);

        if let Some(prefix) = env_string("MINGLE_AUTH_PREFIX") {
            config.auth_prefix = normalize_prefix(&prefix)?;
        }
        config.credentials_path = env_string("MINGLE_CREDENTIALS_PATH").map(PathBuf::from);

        if let Some(value) = env_parse::<u32>("MINGLE_MAX_RETRIES")? {
            config.retry.max_retries = value;
        }
        if let Some(ms) = env_parse::<u64>("MINGLE_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("MINGLE_REQUEST_TIMEOUT_MS")? {
            config.retry.attempt_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("MINGLE_RECONNECT_BASE_MS")? {
            config.reconnect.base_delay = Duration::from_millis(ms);
        }
        if let Some(value) = env_parse::<u32>("MINGLE_RECONNECT_MAX_ATTEMPTS")? {
            config.reconnect.max_attempts = value;
        }
        if let Some(ms) = env_parse::<u64>("MINGLE_TYPING_TIMEOUT_MS")? {
            config.presence.typing_timeout = Some(Duration::from_millis(ms)).filter(|d| !d.is_zero());
        }

        Ok(config)
    }

    /// Whether `path` addresses one of the session endpoints, which never
    /// trigger a credential refresh themselves.
    pub fn is_auth_path(&self, path: &str) -> bool {
        is_auth_path(&self.auth_prefix, path)
    }
}

/// An empty prefix matches nothing.
pub(crate) fn is_auth_path(prefix: &str, path: &str) -> bool {
    !prefix.is_empty() && path.trim_start_matches('/').starts_with(prefix)
}

fn env_string(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(var) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| ConfigError::Invalid {
                var,
                reason: err.to_string(),
            }),
        None => Ok(None),
    }
}

/// Parses a base URL, appending the trailing slash `Url::join` needs.
fn parse_url(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let mut raw = raw.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|err| ConfigError::Invalid {
        var,
        reason: err.to_string(),
    })
}

fn normalize_prefix(raw: &str) -> Result<String, ConfigError> {
    let mut prefix = raw.trim().trim_matches('/').to_string();
    if prefix.is_empty() {
        return Err(ConfigError::Invalid {
            var: "MINGLE_AUTH_PREFIX",
            reason: format!("{raw:?} does not name a path segment"),
        });
    }
    prefix.push('/');
    Ok(prefix)
}
