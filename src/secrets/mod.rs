//! Secret storage for the agent's registration and credential blobs.
//!
//! Everything sensitive the agent persists goes through the [`SecretStore`]
//! trait: an opaque blob keyed by service + account. The production backend
//! is the OS keychain on macOS and an AES-GCM encrypted file elsewhere;
//! tests use the in-memory store.

mod file;
#[cfg(target_os = "macos")]
mod keychain;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;

pub use file::FileSecretStore;
#[cfg(target_os = "macos")]
pub use keychain::KeychainSecretStore;
pub use memory::MemorySecretStore;

use crate::config::Config;
use crate::error::SecretStoreError;

/// Account name for the identity registration blob.
pub const REGISTRATION_ACCOUNT: &str = "registration";
/// Account name for the credential pair blob.
pub const CREDENTIALS_ACCOUNT: &str = "credentials";

/// Service name for secret-store entries, namespaced per installation.
pub fn service_name(namespace: &str) -> String {
    format!("io.fleetd.agent.{namespace}")
}

/// Get/set/delete a named secret blob.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a blob. `Ok(None)` when the entry does not exist.
    async fn get(&self, service: &str, account: &str)
    -> Result<Option<Vec<u8>>, SecretStoreError>;

    /// Store a blob, replacing any existing entry.
    async fn set(&self, service: &str, account: &str, value: &[u8])
    -> Result<(), SecretStoreError>;

    /// Remove a blob. Deleting a missing entry is not an error.
    async fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError>;
}

/// Pick the default backend for this platform.
pub fn default_store(config: &Config) -> Result<Arc<dyn SecretStore>, SecretStoreError> {
    #[cfg(target_os = "macos")]
    {
        let _ = config;
        Ok(Arc::new(KeychainSecretStore::new()))
    }
    #[cfg(not(target_os = "macos"))]
    {
        Ok(Arc::new(FileSecretStore::open(&config.data_dir)?))
    }
}
