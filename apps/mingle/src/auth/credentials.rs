use crate::auth::error::AuthError;
use directories::BaseDirs;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

/// Access tokens are treated as expired this long before their real expiry.
const EXPIRY_SKEW_SECONDS: i64 = 30;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub access_expiry: OffsetDateTime,
}

impl CredentialPair {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        access_expiry: OffsetDateTime,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            access_expiry,
        }
    }

    pub fn expiring_in(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in_seconds: u64,
    ) -> Self {
        let lifetime = Duration::seconds(i64::try_from(expires_in_seconds).unwrap_or(i64::MAX));
        let expiry = OffsetDateTime::now_utc()
            .checked_add(lifetime)
            .unwrap_or(OffsetDateTime::now_utc() + Duration::days(365));
        Self::new(access_token, refresh_token, expiry)
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("access_expiry", &self.access_expiry)
            .finish()
    }
}

pub fn access_token_is_valid(pair: &CredentialPair) -> bool {
    pair.access_expiry > OffsetDateTime::now_utc() + Duration::seconds(EXPIRY_SKEW_SECONDS)
}

/// Durable backing for the credential store.
pub trait CredentialPersistence: Send + Sync {
    fn load(&self) -> Result<Option<CredentialPair>, AuthError>;
    fn save(&self, pair: &CredentialPair) -> Result<(), AuthError>;
    fn clear(&self) -> Result<(), AuthError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session: Option<CredentialPair>,
}

/// TOML file readable only by the current user.
#[derive(Debug, Clone)]
pub struct FileCredentialPersistence {
    path: PathBuf,
}

impl FileCredentialPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Result<PathBuf, AuthError> {
        let base = BaseDirs::new()
            .ok_or_else(|| AuthError::Config("unable to determine home directory".into()))?;
        Ok(base.home_dir().join(".mingle").join("credentials"))
    }
}

impl CredentialPersistence for FileCredentialPersistence {
    fn load(&self) -> Result<Option<CredentialPair>, AuthError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        let file: CredentialsFile = toml::from_str(&raw)?;
        Ok(file.session)
    }

    fn save(&self, pair: &CredentialPair) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let serialized = toml::to_string_pretty(&CredentialsFile {
            session: Some(pair.clone()),
        })?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(serialized.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), AuthError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Keeps nothing beyond the process; handy for tests.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    slot: Mutex<Option<CredentialPair>>,
}

impl MemoryPersistence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seeded(pair: CredentialPair) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Some(pair)),
        })
    }

    pub fn persisted(&self) -> Option<CredentialPair> {
        self.slot.lock().clone()
    }
}

impl CredentialPersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<CredentialPair>, AuthError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, pair: &CredentialPair) -> Result<(), AuthError> {
        *self.slot.lock() = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), AuthError> {
        *self.slot.lock() = None;
        Ok(())
    }
}

/// The current credential pair, shared by the request pipeline and the
/// connection manager. Clones share state.
///
/// Writes land in memory before they are persisted, so readers observe a new
/// pair even if persisting it fails.
#[derive(Clone)]
pub struct CredentialStore {
    current: Arc<RwLock<Option<CredentialPair>>>,
    persistence: Arc<dyn CredentialPersistence>,
}

impl CredentialStore {
    /// Reads the persisted pair once.
    pub fn load(persistence: Arc<dyn CredentialPersistence>) -> Result<Self, AuthError> {
        let current = persistence.load()?;
        Ok(Self {
            current: Arc::new(RwLock::new(current)),
            persistence,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            current: Arc::new(RwLock::new(None)),
            persistence: MemoryPersistence::new(),
        }
    }

    pub fn get(&self) -> Option<CredentialPair> {
        self.current.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current
            .read()
            .as_ref()
            .map(|pair| pair.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.current
            .read()
            .as_ref()
            .map(|pair| pair.refresh_token.clone())
    }

    pub fn is_signed_in(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn set(&self, pair: CredentialPair) -> Result<(), AuthError> {
        {
            let mut guard = self.current.write();
            *guard = Some(pair.clone());
        }
        self.persistence.save(&pair)
    }

    pub fn clear(&self) -> Result<(), AuthError> {
        self.current.write().take();
        self.persistence.clear()
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("signed_in", &self.is_signed_in())
            .finish()
    }
}
