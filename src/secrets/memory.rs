//! In-memory secret store for tests and ephemeral runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::SecretStoreError;
use crate::secrets::SecretStore;

/// Secret store backed by a process-local map. Nothing survives restart.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(
        &self,
        service: &str,
        account: &str,
    ) -> Result<Option<Vec<u8>>, SecretStoreError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(service.to_string(), account.to_string()))
            .cloned())
    }

    async fn set(
        &self,
        service: &str,
        account: &str,
        value: &[u8],
    ) -> Result<(), SecretStoreError> {
        self.entries
            .write()
            .await
            .insert((service.to_string(), account.to_string()), value.to_vec());
        Ok(())
    }

    async fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        self.entries
            .write()
            .await
            .remove(&(service.to_string(), account.to_string()));
        Ok(())
    }
}
