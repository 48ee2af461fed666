//! Persistent storage for the device identity and paired peer keys.
//!
//! # Storage structure
//!
//! ```text
//! ~/.config/botster/
//!     credentials.json / OS keyring      # store_key (AES-256, base64)
//!     e2e/
//!         identity.enc                   # sealed DeviceIdentity
//!         peers.enc                      # sealed fingerprint -> PairedPeerKey
//! ```
//!
//! Writes go to a temp file and are renamed into place, and a process-wide
//! lock serializes every writer, so concurrent sessions on one device never
//! leave a torn identity record behind.

use anyhow::{Context, Result as AnyResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::Config;
use crate::crypto::SealedRecord;
use crate::error::{Result, SessionError};
use crate::identity::DeviceIdentity;
use crate::keyring::{load_or_create_store_key, CredentialBackend};
use crate::pairing::compute_fingerprint;

/// Identity record format. Version 1 records carry no signing key.
const IDENTITY_VERSION: u8 = 2;
/// Peer index format version.
const PEERS_VERSION: u8 = 1;

const IDENTITY_FILE: &str = "identity.enc";
const PEERS_FILE: &str = "peers.enc";

/// Single-writer discipline for every file-backed store in the process.
static STORE_LOCK: Mutex<()> = Mutex::new(());

/// A previously paired peer's long-term public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedPeerKey {
    /// Fingerprint of `public_key`; the index key.
    pub fingerprint: String,
    /// Peer long-term X25519 public key.
    #[serde(with = "base64_key")]
    pub public_key: [u8; 32],
    /// Name the peer announced.
    pub display_name: String,
    /// When the pairing last succeeded.
    pub paired_at: DateTime<Utc>,
}

impl PairedPeerKey {
    /// Record a pairing with `public_key` happening now.
    pub fn new(public_key: [u8; 32], display_name: impl Into<String>) -> Self {
        Self {
            fingerprint: compute_fingerprint(&public_key),
            public_key,
            display_name: display_name.into(),
            paired_at: Utc::now(),
        }
    }
}

mod base64_key {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let encoded = String::deserialize(d)?;
        let bytes = BASE64.decode(encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|v: Vec<u8>| D::Error::custom(format!("expected 32 bytes, got {}", v.len())))
    }
}

/// Persistent per-device key storage.
///
/// Absence of an identity is not an error: it means first run.
pub trait KeyStore: Send + Sync {
    /// Load the device identity, if one has been saved.
    fn load_identity(&self) -> Result<Option<DeviceIdentity>>;

    /// Persist the device identity.
    fn save_identity(&self, identity: &DeviceIdentity) -> Result<()>;

    /// Look up a paired peer by fingerprint.
    fn get_peer_key(&self, fingerprint: &str) -> Result<Option<PairedPeerKey>>;

    /// Insert or replace a paired peer.
    fn put_peer_key(&self, peer: PairedPeerKey) -> Result<()>;

    /// All paired peers, most recent first.
    fn list_peer_keys(&self) -> Result<Vec<PairedPeerKey>>;
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| SessionError::Storage("key store lock poisoned".into()))
}

fn sorted_newest_first(mut peers: Vec<PairedPeerKey>) -> Vec<PairedPeerKey> {
    peers.sort_by(|a, b| b.paired_at.cmp(&a.paired_at));
    peers
}

// ============================================================================
// In-memory store
// ============================================================================

/// Key store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryKeyStore {
    identity: Mutex<Option<DeviceIdentity>>,
    peers: Mutex<HashMap<String, PairedPeerKey>>,
}

impl std::fmt::Debug for MemoryKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyStore").finish_non_exhaustive()
    }
}

impl MemoryKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load_identity(&self) -> Result<Option<DeviceIdentity>> {
        Ok(lock(&self.identity)?.clone())
    }

    fn save_identity(&self, identity: &DeviceIdentity) -> Result<()> {
        *lock(&self.identity)? = Some(identity.clone());
        Ok(())
    }

    fn get_peer_key(&self, fingerprint: &str) -> Result<Option<PairedPeerKey>> {
        Ok(lock(&self.peers)?.get(fingerprint).cloned())
    }

    fn put_peer_key(&self, peer: PairedPeerKey) -> Result<()> {
        lock(&self.peers)?.insert(peer.fingerprint.clone(), peer);
        Ok(())
    }

    fn list_peer_keys(&self) -> Result<Vec<PairedPeerKey>> {
        Ok(sorted_newest_first(
            lock(&self.peers)?.values().cloned().collect(),
        ))
    }
}

// ============================================================================
// File-backed store
// ============================================================================

/// Identity as sealed on disk.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredIdentity {
    /// Base64 X25519 private key.
    encryption_secret: String,
    /// Base64 Ed25519 seed. Absent in legacy (version 1) records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signing_secret: Option<String>,
}

/// Key store sealing records with AES-256-GCM under a keyring-held key.
pub struct FileKeyStore {
    dir: PathBuf,
    store_key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for FileKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKeyStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl FileKeyStore {
    /// Open the store under the default config directory.
    pub fn open_default() -> Result<Self> {
        let config_dir = Config::config_dir()?;
        let backend = CredentialBackend::for_environment(&config_dir);
        Self::open(config_dir.join("e2e"), &backend)
    }

    /// Open (creating if needed) a store rooted at `dir`.
    ///
    /// Fails if the at-rest key can neither be loaded nor persisted.
    pub fn open(dir: impl Into<PathBuf>, backend: &CredentialBackend) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create key store directory {}", dir.display()))?;
        let store_key = Zeroizing::new(load_or_create_store_key(backend)?);
        Ok(Self { dir, store_key })
    }

    /// Open a store with an explicit at-rest key.
    pub fn with_key(dir: impl Into<PathBuf>, store_key: [u8; 32]) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create key store directory {}", dir.display()))?;
        Ok(Self {
            dir,
            store_key: Zeroizing::new(store_key),
        })
    }

    /// Directory holding the sealed records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_sealed(&self, name: &str) -> AnyResult<Option<(u8, Zeroizing<Vec<u8>>)>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {name}"))?;
        let sealed: SealedRecord =
            serde_json::from_str(&content).with_context(|| format!("Failed to parse {name}"))?;
        let plaintext = sealed
            .open(&self.store_key, name)
            .with_context(|| format!("Failed to unseal {name} (store key changed?)"))?;
        Ok(Some((sealed.version, plaintext)))
    }

    fn write_sealed(&self, name: &str, version: u8, plaintext: &[u8]) -> AnyResult<()> {
        let sealed = SealedRecord::seal(&self.store_key, name, version, plaintext)?;
        let content = serde_json::to_string_pretty(&sealed)
            .context("Failed to serialize sealed record")?;

        let path = self.dir.join(name);
        let tmp_path = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp_path, content).with_context(|| format!("Failed to write {name}"))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to set {name} permissions"))?;
        }

        fs::rename(&tmp_path, &path).with_context(|| format!("Failed to replace {name}"))?;
        log::debug!("Saved sealed record to {:?}", path);
        Ok(())
    }

    fn save_identity_unlocked(&self, identity: &DeviceIdentity) -> AnyResult<()> {
        let stored = StoredIdentity {
            encryption_secret: BASE64.encode(*identity.encryption_secret_bytes()),
            signing_secret: Some(BASE64.encode(*identity.signing_secret_bytes())),
        };
        let plaintext =
            Zeroizing::new(serde_json::to_vec(&stored).context("Failed to serialize identity")?);
        self.write_sealed(IDENTITY_FILE, IDENTITY_VERSION, &plaintext)
    }

    fn read_peers(&self) -> AnyResult<HashMap<String, PairedPeerKey>> {
        match self.read_sealed(PEERS_FILE)? {
            Some((_, plaintext)) => {
                serde_json::from_slice(&plaintext).context("Failed to deserialize peer index")
            }
            None => Ok(HashMap::new()),
        }
    }
}

fn decode_secret(encoded: &str, what: &str) -> AnyResult<Zeroizing<[u8; 32]>> {
    let bytes = Zeroizing::new(
        BASE64
            .decode(encoded)
            .with_context(|| format!("Invalid {what} encoding"))?,
    );
    let mut key = Zeroizing::new([0u8; 32]);
    if bytes.len() != key.len() {
        anyhow::bail!("Invalid {what} length: {}", bytes.len());
    }
    key.copy_from_slice(&bytes);
    Ok(key)
}

impl KeyStore for FileKeyStore {
    fn load_identity(&self) -> Result<Option<DeviceIdentity>> {
        let _guard = lock(&STORE_LOCK)?;

        let Some((version, plaintext)) = self.read_sealed(IDENTITY_FILE)? else {
            return Ok(None);
        };
        let stored: StoredIdentity =
            serde_json::from_slice(&plaintext).context("Failed to deserialize identity")?;
        let encryption_secret = decode_secret(&stored.encryption_secret, "encryption key")?;

        let identity = match stored.signing_secret.as_deref() {
            Some(signing) => {
                let signing_secret = decode_secret(signing, "signing key")?;
                DeviceIdentity::from_secrets(&encryption_secret, &signing_secret)
            }
            None => {
                let identity = DeviceIdentity::upgrade_legacy(&encryption_secret);
                self.save_identity_unlocked(&identity)?;
                log::info!(
                    "Upgraded legacy identity record (v{version}) with a signing key: fingerprint={}",
                    identity.fingerprint()
                );
                identity
            }
        };
        Ok(Some(identity))
    }

    fn save_identity(&self, identity: &DeviceIdentity) -> Result<()> {
        let _guard = lock(&STORE_LOCK)?;
        self.save_identity_unlocked(identity)?;
        Ok(())
    }

    fn get_peer_key(&self, fingerprint: &str) -> Result<Option<PairedPeerKey>> {
        let _guard = lock(&STORE_LOCK)?;
        Ok(self.read_peers()?.remove(fingerprint))
    }

    fn put_peer_key(&self, peer: PairedPeerKey) -> Result<()> {
        let _guard = lock(&STORE_LOCK)?;
        let mut peers = self.read_peers()?;
        log::debug!("Caching paired peer key: fingerprint={}", peer.fingerprint);
        peers.insert(peer.fingerprint.clone(), peer);
        let plaintext = serde_json::to_vec(&peers).context("Failed to serialize peer index")?;
        self.write_sealed(PEERS_FILE, PEERS_VERSION, &plaintext)?;
        Ok(())
    }

    fn list_peer_keys(&self) -> Result<Vec<PairedPeerKey>> {
        let _guard = lock(&STORE_LOCK)?;
        Ok(sorted_newest_first(
            self.read_peers()?.into_values().collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, FileKeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::with_key(dir.path().join("e2e"), [9u8; 32]).unwrap();
        (dir, store)
    }

    #[test]
    fn test_identity_absent_on_first_run() {
        let (_dir, store) = temp_store();
        assert!(store.load_identity().unwrap().is_none());
    }

    #[test]
    fn test_identity_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let identity = DeviceIdentity::generate();
        {
            let store = FileKeyStore::with_key(dir.path(), [3u8; 32]).unwrap();
            store.save_identity(&identity).unwrap();
        }
        let reopened = FileKeyStore::with_key(dir.path(), [3u8; 32]).unwrap();
        assert_eq!(reopened.load_identity().unwrap(), Some(identity));
    }

    #[test]
    fn test_identity_is_sealed_on_disk() {
        let (_dir, store) = temp_store();
        let identity = DeviceIdentity::generate();
        store.save_identity(&identity).unwrap();

        let raw = fs::read_to_string(store.dir().join(IDENTITY_FILE)).unwrap();
        let secret = BASE64.encode(*identity.encryption_secret_bytes());
        assert!(!raw.contains(&secret));
        assert!(!store.dir().join(format!("{IDENTITY_FILE}.tmp")).exists());
    }

    #[test]
    fn test_wrong_store_key_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        FileKeyStore::with_key(dir.path(), [1u8; 32])
            .unwrap()
            .save_identity(&DeviceIdentity::generate())
            .unwrap();

        let other = FileKeyStore::with_key(dir.path(), [2u8; 32]).unwrap();
        assert!(matches!(
            other.load_identity(),
            Err(SessionError::Storage(_))
        ));
    }

    #[test]
    fn test_peer_index_copied_over_identity_is_rejected() {
        let (_dir, store) = temp_store();
        store.save_identity(&DeviceIdentity::generate()).unwrap();
        store
            .put_peer_key(PairedPeerKey::new([5u8; 32], "Chrome"))
            .unwrap();

        fs::copy(store.dir().join(PEERS_FILE), store.dir().join(IDENTITY_FILE)).unwrap();
        assert!(matches!(
            store.load_identity(),
            Err(SessionError::Storage(_))
        ));
    }

    #[test]
    fn test_relabelled_identity_version_is_rejected() {
        let (_dir, store) = temp_store();
        store.save_identity(&DeviceIdentity::generate()).unwrap();

        let path = store.dir().join(IDENTITY_FILE);
        let mut sealed: SealedRecord =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        sealed.version = 1;
        fs::write(&path, serde_json::to_string(&sealed).unwrap()).unwrap();

        assert!(matches!(
            store.load_identity(),
            Err(SessionError::Storage(_))
        ));
    }

    #[test]
    fn test_legacy_identity_upgraded_in_place() {
        let (_dir, store) = temp_store();
        let original = DeviceIdentity::generate();
        let legacy = StoredIdentity {
            encryption_secret: BASE64.encode(*original.encryption_secret_bytes()),
            signing_secret: None,
        };
        store
            .write_sealed(IDENTITY_FILE, 1, &serde_json::to_vec(&legacy).unwrap())
            .unwrap();

        let upgraded = store.load_identity().unwrap().unwrap();
        assert_eq!(
            upgraded.encryption_public_key(),
            original.encryption_public_key()
        );

        // The generated signing key was persisted, not regenerated per load.
        let reloaded = store.load_identity().unwrap().unwrap();
        assert_eq!(reloaded, upgraded);
    }

    #[test]
    fn test_peer_keys_roundtrip_and_update() {
        let (_dir, store) = temp_store();
        let peer = PairedPeerKey::new([5u8; 32], "Chrome on laptop");
        store.put_peer_key(peer.clone()).unwrap();

        let loaded = store.get_peer_key(&peer.fingerprint).unwrap().unwrap();
        assert_eq!(loaded, peer);
        assert!(store.get_peer_key("00:00").unwrap().is_none());

        let renamed = PairedPeerKey::new([5u8; 32], "Firefox on laptop");
        store.put_peer_key(renamed).unwrap();
        let peers = store.list_peer_keys().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].display_name, "Firefox on laptop");
    }

    #[test]
    fn test_concurrent_load_or_create_yields_one_identity() {
        let (_dir, store) = temp_store();
        let store = std::sync::Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || DeviceIdentity::load_or_create(&*store).unwrap())
            })
            .collect();

        let identities: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(identities.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.load_identity().unwrap().as_ref(), identities.first());
    }

    #[test]
    fn test_memory_store_lists_newest_first() {
        let store = MemoryKeyStore::new();
        let mut older = PairedPeerKey::new([1u8; 32], "old");
        older.paired_at = Utc::now() - chrono::Duration::hours(1);
        store.put_peer_key(older).unwrap();
        store.put_peer_key(PairedPeerKey::new([2u8; 32], "new")).unwrap();

        let names: Vec<_> = store
            .list_peer_keys()
            .unwrap()
            .into_iter()
            .map(|p| p.display_name)
            .collect();
        assert_eq!(names, vec!["new", "old"]);
    }
}
