pub mod credentials;
pub mod error;
pub mod gate;
pub mod refresh;

use crate::config::ClientConfig;
use std::sync::Arc;

pub use credentials::{
    CredentialPair, CredentialPersistence, CredentialStore, FileCredentialPersistence,
    MemoryPersistence, access_token_is_valid,
};
pub use error::AuthError;
pub use gate::{SessionGateway, TokenResponse};
pub use refresh::{RefreshCoordinator, RefreshError};

/// File persistence at the configured path, or `~/.mingle/credentials`.
pub fn file_persistence(config: &ClientConfig) -> Result<Arc<FileCredentialPersistence>, AuthError> {
    let path = match &config.credentials_path {
        Some(path) => path.clone(),
        None => FileCredentialPersistence::default_path()?,
    };
    Ok(Arc::new(FileCredentialPersistence::new(path)))
}
