//! Device identity: the long-term keys of this installation.
//!
//! Each device owns exactly one identity, made of two keypairs that always
//! travel together:
//! - X25519 encryption keypair (its public half goes into pairing URLs)
//! - Ed25519 signing keypair (signs presence announcements)
//!
//! The identity is created on first run and never regenerated once present.
//! [`shared`] exposes it as a lazily-initialized, process-wide singleton
//! backed by the default [`FileKeyStore`].

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use std::sync::{Arc, Mutex, OnceLock};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{Result, SessionError};
use crate::keystore::{FileKeyStore, KeyStore};
use crate::pairing::compute_fingerprint;

/// Long-term keys of this device.
#[derive(Clone)]
pub struct DeviceIdentity {
    encryption_secret: StaticSecret,
    encryption_public: PublicKey,
    signing_key: SigningKey,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.encryption_public == other.encryption_public
            && self.signing_key.verifying_key() == other.signing_key.verifying_key()
    }
}

/// Serializes load-or-create so two sessions never both generate an identity.
static DEVICE_LOCK: Mutex<()> = Mutex::new(());

/// Process-wide identity, set once by [`shared`].
static SHARED_IDENTITY: OnceLock<Arc<DeviceIdentity>> = OnceLock::new();

impl DeviceIdentity {
    /// Generate a fresh identity with both keypairs.
    pub fn generate() -> Self {
        let encryption_secret = Zeroizing::new(random_bytes());
        let signing_secret = Zeroizing::new(random_bytes());
        Self::from_secrets(&encryption_secret, &signing_secret)
    }

    /// Rebuild an identity from its two private halves.
    pub fn from_secrets(encryption_secret: &[u8; 32], signing_secret: &[u8; 32]) -> Self {
        let encryption_secret = StaticSecret::from(*encryption_secret);
        let encryption_public = PublicKey::from(&encryption_secret);
        Self {
            encryption_secret,
            encryption_public,
            signing_key: SigningKey::from_bytes(signing_secret),
        }
    }

    /// Build an identity for a legacy record that predates signing keys.
    ///
    /// The encryption keypair is kept; a signing keypair is generated.
    pub fn upgrade_legacy(encryption_secret: &[u8; 32]) -> Self {
        let signing_secret = Zeroizing::new(random_bytes());
        Self::from_secrets(encryption_secret, &signing_secret)
    }

    /// Load the identity from `store`, creating and persisting one if absent.
    ///
    /// A store that fails to read is an error, never a reason to generate a
    /// replacement identity.
    pub fn load_or_create(store: &dyn KeyStore) -> Result<Self> {
        let _guard = DEVICE_LOCK
            .lock()
            .map_err(|_| SessionError::Storage("device lock poisoned".into()))?;

        if let Some(identity) = store.load_identity()? {
            log::info!("Loaded device identity: fingerprint={}", identity.fingerprint());
            return Ok(identity);
        }

        let identity = Self::generate();
        store.save_identity(&identity)?;
        log::info!(
            "Created new device identity: fingerprint={}",
            identity.fingerprint()
        );
        Ok(identity)
    }

    /// Raw X25519 public key (goes into pairing URLs and announcements).
    pub fn encryption_public_key(&self) -> [u8; 32] {
        self.encryption_public.to_bytes()
    }

    /// X25519 private key, for the one-time key exchange.
    pub(crate) fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption_secret
    }

    /// Raw X25519 private key bytes, for persistence only.
    pub(crate) fn encryption_secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.encryption_secret.to_bytes())
    }

    /// Raw Ed25519 seed bytes, for persistence only.
    pub(crate) fn signing_secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Ed25519 verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message with the device signing key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Fingerprint of the encryption public key.
    pub fn fingerprint(&self) -> String {
        compute_fingerprint(self.encryption_public.as_bytes())
    }
}

/// The process-wide device identity.
///
/// Loaded (or created) from the default file store on first call; every
/// later call returns the same instance for the life of the process.
pub fn shared() -> Result<Arc<DeviceIdentity>> {
    if let Some(identity) = SHARED_IDENTITY.get() {
        return Ok(Arc::clone(identity));
    }

    let store = FileKeyStore::open_default()?;
    let identity = Arc::new(DeviceIdentity::load_or_create(&store)?);

    // A concurrent first call may have won the race; both loaded the same record.
    if SHARED_IDENTITY.set(Arc::clone(&identity)).is_err() {
        log::debug!("Shared identity already initialized by another caller");
    }
    Ok(SHARED_IDENTITY.get().map_or(identity, Arc::clone))
}

fn random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}
