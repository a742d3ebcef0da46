//! macOS keychain secret store using generic-password items.

use async_trait::async_trait;
use security_framework::passwords::{
    delete_generic_password, get_generic_password, set_generic_password,
};

use crate::error::SecretStoreError;
use crate::secrets::SecretStore;

/// `errSecItemNotFound`: the item does not exist.
const ERR_SEC_ITEM_NOT_FOUND: i32 = -25300;

/// Secret store backed by the login keychain.
#[derive(Debug, Default)]
pub struct KeychainSecretStore;

impl KeychainSecretStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SecretStore for KeychainSecretStore {
    async fn get(
        &self,
        service: &str,
        account: &str,
    ) -> Result<Option<Vec<u8>>, SecretStoreError> {
        match get_generic_password(service, account) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.code() == ERR_SEC_ITEM_NOT_FOUND => Ok(None),
            Err(e) => Err(SecretStoreError::Keychain {
                detail: e.to_string(),
            }),
        }
    }

    async fn set(
        &self,
        service: &str,
        account: &str,
        value: &[u8],
    ) -> Result<(), SecretStoreError> {
        set_generic_password(service, account, value).map_err(|e| SecretStoreError::Keychain {
            detail: e.to_string(),
        })
    }

    async fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        match delete_generic_password(service, account) {
            Ok(()) => Ok(()),
            Err(e) if e.code() == ERR_SEC_ITEM_NOT_FOUND => Ok(()),
            Err(e) => Err(SecretStoreError::Keychain {
                detail: e.to_string(),
            }),
        }
    }
}
