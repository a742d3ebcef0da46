//! Encrypted file-backed secret store.
//!
//! Entries live in a single JSON file under the agent data dir. Each value
//! is sealed with AES-256-GCM under a key derived (HKDF-SHA256) from a
//! machine-local key file created on first use with 0600 permissions. This
//! is the default backend on platforms without a supported OS keychain.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::error::SecretStoreError;
use crate::secrets::SecretStore;

const KEY_FILE: &str = "store.key";
const ENTRIES_FILE: &str = "secrets.json";
const HKDF_INFO: &[u8] = b"fleetd-secret-store-v1";
const NONCE_LEN: usize = 12;

#[derive(Debug, Serialize, Deserialize)]
struct SealedEntry {
    nonce: String,
    data: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EntriesFile {
    entries: HashMap<String, SealedEntry>,
}

/// Secret store sealing blobs into a single encrypted JSON file.
pub struct FileSecretStore {
    path: PathBuf,
    key: [u8; 32],
    /// Serializes read-modify-write cycles on the entries file.
    lock: Mutex<()>,
}

impl FileSecretStore {
    /// Open (or initialize) the store under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, SecretStoreError> {
        std::fs::create_dir_all(data_dir)?;
        let key = load_or_create_key(&data_dir.join(KEY_FILE))?;

        Ok(Self {
            path: data_dir.join(ENTRIES_FILE),
            key,
            lock: Mutex::new(()),
        })
    }

    fn entry_key(service: &str, account: &str) -> String {
        format!("{service}/{account}")
    }

    fn load_entries(&self) -> Result<EntriesFile, SecretStoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EntriesFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_entries(&self, entries: &EntriesFile) -> Result<(), SecretStoreError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        write_private(&self.path, &bytes)?;
        Ok(())
    }

    fn seal(&self, plaintext: &[u8]) -> Result<SealedEntry, SecretStoreError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| SecretStoreError::Crypto {
                detail: "encryption failed".to_string(),
            })?;

        Ok(SealedEntry {
            nonce: BASE64.encode(nonce_bytes),
            data: BASE64.encode(ciphertext),
        })
    }

    fn unseal(&self, entry: &SealedEntry) -> Result<Vec<u8>, SecretStoreError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let nonce_bytes = BASE64
            .decode(&entry.nonce)
            .map_err(|e| SecretStoreError::Crypto {
                detail: format!("bad nonce encoding: {e}"),
            })?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(SecretStoreError::Crypto {
                detail: "bad nonce length".to_string(),
            });
        }
        let ciphertext = BASE64
            .decode(&entry.data)
            .map_err(|e| SecretStoreError::Crypto {
                detail: format!("bad ciphertext encoding: {e}"),
            })?;

        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| SecretStoreError::Crypto {
                detail: "decryption failed (wrong key or corrupted store)".to_string(),
            })
    }
}

#[async_trait::async_trait]
impl SecretStore for FileSecretStore {
    async fn get(
        &self,
        service: &str,
        account: &str,
    ) -> Result<Option<Vec<u8>>, SecretStoreError> {
        let _guard = self.lock.lock().await;
        let entries = self.load_entries()?;
        match entries.entries.get(&Self::entry_key(service, account)) {
            Some(sealed) => Ok(Some(self.unseal(sealed)?)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        service: &str,
        account: &str,
        value: &[u8],
    ) -> Result<(), SecretStoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load_entries()?;
        entries
            .entries
            .insert(Self::entry_key(service, account), self.seal(value)?);
        self.save_entries(&entries)
    }

    async fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load_entries()?;
        if entries
            .entries
            .remove(&Self::entry_key(service, account))
            .is_some()
        {
            self.save_entries(&entries)?;
        }
        Ok(())
    }
}

/// Load the master key file, creating it with fresh random material if absent.
fn load_or_create_key(path: &Path) -> Result<[u8; 32], SecretStoreError> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() == 32 => derive_key(&bytes),
        Ok(_) => Err(SecretStoreError::Crypto {
            detail: "key file has wrong length".to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut ikm = [0u8; 32];
            OsRng.fill_bytes(&mut ikm);
            write_private(path, &ikm)?;
            derive_key(&ikm)
        }
        Err(e) => Err(e.into()),
    }
}

fn derive_key(ikm: &[u8]) -> Result<[u8; 32], SecretStoreError> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| SecretStoreError::Crypto {
            detail: "key derivation failed".to_string(),
        })?;
    Ok(okm)
}

/// Write a file readable only by the current user.
fn write_private(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    std::fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
