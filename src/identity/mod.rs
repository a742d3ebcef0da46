//! Device identity: discovery of a stable device ID and persistence of the
//! enrollment registration record.

mod discovery;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;
use crate::secrets::{REGISTRATION_ACCOUNT, SecretStore, service_name};

pub use discovery::discover_device_id;

/// The record created once at successful enrollment. Immutable except on
/// full reset, which clears and recreates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    /// Hardware serial number or equivalent stable identifier.
    pub device_id: String,
    pub hostname: String,
    pub platform: String,
    /// The one-time token this device enrolled with.
    pub enrollment_token: String,
    pub enrolled_at: DateTime<Utc>,
}

/// Owns the registration record; the only writer of its secret-store blob.
pub struct IdentityManager {
    store: Arc<dyn SecretStore>,
    service: String,
}

impl IdentityManager {
    pub fn new(store: Arc<dyn SecretStore>, namespace: &str) -> Self {
        Self {
            store,
            service: service_name(namespace),
        }
    }

    /// Discover the device's stable identifier.
    ///
    /// Tries a fast system-property lookup, then a structured hardware
    /// inventory query, then a low-level registry/DMI read; the first
    /// non-empty well-formed result wins. Each probe is independently
    /// time-boxed so a wedged OS utility cannot stall startup.
    pub async fn discover_device_id(&self) -> Result<String, IdentityError> {
        discovery::discover_device_id().await
    }

    /// Persist the registration record.
    pub async fn store_registration(&self, record: &Registration) -> Result<(), IdentityError> {
        let bytes = serde_json::to_vec(record).map_err(crate::error::SecretStoreError::from)?;
        self.store
            .set(&self.service, REGISTRATION_ACCOUNT, &bytes)
            .await?;
        tracing::info!(device_id = %record.device_id, "registration stored");
        Ok(())
    }

    /// Load the registration record, if any.
    pub async fn load_registration(&self) -> Result<Option<Registration>, IdentityError> {
        match self.store.get(&self.service, REGISTRATION_ACCOUNT).await? {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .map_err(crate::error::SecretStoreError::from)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Erase the registration record.
    pub async fn clear(&self) -> Result<(), IdentityError> {
        self.store
            .delete(&self.service, REGISTRATION_ACCOUNT)
            .await?;
        Ok(())
    }

    /// True iff a registration exists.
    pub async fn is_ready(&self) -> bool {
        matches!(self.load_registration().await, Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemorySecretStore;

    fn sample_registration() -> Registration {
        Registration {
            device_id: "C02ABC".to_string(),
            hostname: "mac-042".to_string(),
            platform: "macos".to_string(),
            enrollment_token: "abc123".to_string(),
            enrolled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_store_load_clear() {
        let manager = IdentityManager::new(Arc::new(MemorySecretStore::new()), "test");

        assert!(!manager.is_ready().await);
        assert!(manager.load_registration().await.unwrap().is_none());

        manager
            .store_registration(&sample_registration())
            .await
            .unwrap();
        assert!(manager.is_ready().await);

        let loaded = manager.load_registration().await.unwrap().unwrap();
        assert_eq!(loaded.device_id, "C02ABC");
        assert_eq!(loaded.enrollment_token, "abc123");

        manager.clear().await.unwrap();
        assert!(!manager.is_ready().await);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = Arc::new(MemorySecretStore::new());
        let a = IdentityManager::new(store.clone(), "a");
        let b = IdentityManager::new(store, "b");

        a.store_registration(&sample_registration()).await.unwrap();
        assert!(a.is_ready().await);
        assert!(!b.is_ready().await);
    }
}
