//! Consolidated keyring storage for the at-rest store key.
//!
//! The file-backed key store seals identity and peer records with an
//! AES-256 key. That key lives in a single OS keyring entry so the identity
//! files on disk are useless without the user's keychain.
//!
//! # Storage
//!
//! Production: Single OS keyring entry `botster/credentials` containing JSON.
//! Test mode: File at `{config_dir}/credentials.json`.
//!
//! The entry is shared with the rest of the botster CLI; unknown fields are
//! preserved on save so other components' secrets are never dropped.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use keyring::Entry;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use zeroize::Zeroize;

/// Keyring service name.
const KEYRING_SERVICE: &str = "botster";
/// Consolidated keyring entry name.
const KEYRING_CREDENTIALS: &str = "credentials";

/// Serializes the load-or-create of the store key within this process.
static BOOTSTRAP_LOCK: Mutex<()> = Mutex::new(());

/// Where the credentials record lives.
#[derive(Debug, Clone)]
pub enum CredentialBackend {
    /// OS keychain / Secret Service entry.
    Keyring,
    /// Plain JSON file (test environments, headless CI).
    File(PathBuf),
}

impl CredentialBackend {
    /// Backend for the current environment.
    pub fn for_environment(config_dir: &Path) -> Self {
        if crate::env::should_skip_keyring() {
            Self::File(config_dir.join("credentials.json"))
        } else {
            Self::Keyring
        }
    }
}

/// Consolidated credentials stored in a single keyring entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Credentials {
    /// Base64-encoded AES-256 key sealing the E2E key store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_key: Option<String>,

    /// Fields owned by other botster components, kept verbatim.
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl Credentials {
    /// Load credentials from the backend. A missing entry is an empty record.
    pub fn load(backend: &CredentialBackend) -> Result<Self> {
        match backend {
            CredentialBackend::File(path) => {
                if !path.exists() {
                    log::debug!("No credentials file found, returning empty");
                    return Ok(Self::default());
                }
                let content = fs::read_to_string(path).context("Failed to read credentials file")?;
                serde_json::from_str(&content).context("Failed to parse credentials file")
            }
            CredentialBackend::Keyring => {
                let entry = Entry::new(KEYRING_SERVICE, KEYRING_CREDENTIALS)
                    .map_err(|e| anyhow::anyhow!("Failed to create keyring entry: {e:?}"))?;
                match entry.get_password() {
                    Ok(json) => serde_json::from_str(&json).context("Keyring data corrupted"),
                    Err(keyring::Error::NoEntry) => {
                        log::debug!("No credentials found in keyring, returning empty");
                        Ok(Self::default())
                    }
                    Err(e) => Err(anyhow::anyhow!("Keyring access failed: {e:?}")),
                }
            }
        }
    }

    /// Save credentials to the backend.
    pub fn save(&self, backend: &CredentialBackend) -> Result<()> {
        let json = serde_json::to_string(self)?;
        match backend {
            CredentialBackend::File(path) => {
                fs::write(path, json).context("Failed to write credentials file")?;
                #[cfg(unix)]
                fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
                log::debug!("Saved credentials to file (test mode)");
            }
            CredentialBackend::Keyring => {
                let entry = Entry::new(KEYRING_SERVICE, KEYRING_CREDENTIALS)
                    .map_err(|e| anyhow::anyhow!("Failed to create keyring entry: {e:?}"))?;
                entry
                    .set_password(&json)
                    .map_err(|e| anyhow::anyhow!("Failed to store credentials in keyring: {e:?}"))?;
                log::info!("Saved consolidated credentials to OS keyring");
            }
        }
        Ok(())
    }

    /// Decode the stored store key, if any.
    pub fn store_key(&self) -> Result<Option<[u8; 32]>> {
        let Some(encoded) = self.store_key.as_deref() else {
            return Ok(None);
        };
        let bytes = BASE64
            .decode(encoded)
            .context("Invalid store key encoding in credentials")?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::anyhow!("Invalid store key length: {}", v.len()))?;
        Ok(Some(key))
    }

    /// Set the store key.
    pub fn set_store_key(&mut self, key: &[u8; 32]) {
        self.store_key = Some(BASE64.encode(key));
    }
}

/// Load the store key, generating and persisting one on first use.
///
/// Generation only succeeds if the key can be saved; a key that cannot be
/// persisted would orphan every record sealed with it.
///
/// Callers racing on an empty record all end up with the same key: the
/// check and the save happen under one lock, and the returned key is the
/// one read back from the record rather than the one generated.
pub fn load_or_create_store_key(backend: &CredentialBackend) -> Result<[u8; 32]> {
    let _guard = BOOTSTRAP_LOCK
        .lock()
        .map_err(|_| anyhow::anyhow!("store key bootstrap lock poisoned"))?;

    let mut creds = Credentials::load(backend)?;
    if let Some(key) = creds.store_key()? {
        log::debug!("Loaded store key from consolidated credentials");
        return Ok(key);
    }

    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    creds.set_store_key(&key);
    creds.save(backend)?;
    key.zeroize();

    let stored = Credentials::load(backend)?
        .store_key()?
        .context("Store key missing from credentials after save")?;
    log::info!("Generated and stored new E2E store key");
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_key_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CredentialBackend::File(dir.path().join("credentials.json"));

        let first = load_or_create_store_key(&backend).unwrap();
        let second = load_or_create_store_key(&backend).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_racing_bootstrap_agrees_on_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CredentialBackend::File(dir.path().join("credentials.json"));

        let keys: Vec<[u8; 32]> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| load_or_create_store_key(&backend).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(keys.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(load_or_create_store_key(&backend).unwrap(), keys[0]);
    }

    #[test]
    fn test_unknown_fields_survive_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, r#"{"api_token":"btstr_abc","version":1}"#).unwrap();
        let backend = CredentialBackend::File(path.clone());

        load_or_create_store_key(&backend).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["api_token"], "btstr_abc");
        assert!(raw["store_key"].is_string());
    }

    #[test]
    fn test_bad_store_key_length_is_error() {
        let creds = Credentials {
            store_key: Some(BASE64.encode([1u8; 16])),
            ..Credentials::default()
        };
        assert!(creds.store_key().is_err());
    }

    #[test]
    fn test_credentials_skip_none_fields() {
        let json = serde_json::to_string(&Credentials::default()).unwrap();
        assert_eq!(json, "{}");
    }
}
