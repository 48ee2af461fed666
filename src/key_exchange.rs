//! One-time X25519 exchange between long-term keys, seeding the ratchet.
//!
//! The output is raw DH material: it only ever feeds the ratchet's
//! initialization KDF and is never used as an encryption key itself.

use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SessionError};

/// Raw Diffie-Hellman output. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Derive the raw shared secret between `local_secret` and `peer_public_key`.
///
/// Low-order peer points yield an all-zero (non-contributory) output and are
/// rejected with [`SessionError::WeakPeerKey`].
pub fn derive_shared_secret(
    peer_public_key: &[u8; 32],
    local_secret: &StaticSecret,
) -> Result<SharedSecret> {
    let peer = PublicKey::from(*peer_public_key);
    let shared = local_secret.diffie_hellman(&peer);

    if !shared.was_contributory() {
        log::warn!("Rejected non-contributory peer public key");
        return Err(SessionError::WeakPeerKey(
            "peer key is a low-order point".into(),
        ));
    }

    Ok(SharedSecret(shared.to_bytes()))
}
