//! Signed presence announcements.
//!
//! Each side signs its long-term encryption public key, together with the
//! fresh ratchet key for this session, with its Ed25519 signing key and
//! sends, in plaintext over the relay:
//!
//! ```json
//! {"type":"presence","display_name":"…","public_key":"<b64>",
//!  "ratchet_key":"<b64>","signature":"<b64>","verifying_key":"<b64>"}
//! ```
//!
//! The receiver checks the signature and, when it holds the sender's key
//! from pairing, that the announced key is that key. Either failure is a
//! [`SessionError::PresenceMismatch`] and an active-attack signal.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::identity::DeviceIdentity;
use crate::pairing::compute_fingerprint;

/// Plaintext handshake messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
enum HandshakeMessage {
    #[serde(rename = "presence")]
    Presence(PresenceAnnouncement),
}

/// A device's signed claim over its encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceAnnouncement {
    /// Human-readable device name.
    pub display_name: String,
    /// Base64 X25519 encryption public key.
    pub public_key: String,
    /// Base64 X25519 ratchet key for this session.
    pub ratchet_key: String,
    /// Base64 Ed25519 signature over [`signed_payload`].
    pub signature: String,
    /// Base64 Ed25519 verifying key.
    pub verifying_key: String,
}

/// An announcement that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPeer {
    /// Peer long-term encryption public key.
    pub public_key: [u8; 32],
    /// Peer ratchet key for this session.
    pub ratchet_key: [u8; 32],
    /// Peer signing key.
    pub verifying_key: VerifyingKey,
    /// Name the peer announced.
    pub display_name: String,
}

impl VerifiedPeer {
    /// Fingerprint of the peer's encryption key.
    pub fn fingerprint(&self) -> String {
        compute_fingerprint(&self.public_key)
    }
}

const SIGNATURE_CONTEXT: &[u8] = b"botster-e2e/presence";

/// Bytes covered by the announcement signature.
pub(crate) fn signed_payload(public_key: &[u8; 32], ratchet_key: &[u8; 32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(SIGNATURE_CONTEXT.len() + 64);
    payload.extend_from_slice(SIGNATURE_CONTEXT);
    payload.extend_from_slice(public_key);
    payload.extend_from_slice(ratchet_key);
    payload
}

fn reject(reason: &str) -> SessionError {
    log::error!("Presence announcement rejected: {reason}");
    SessionError::PresenceMismatch(reason.to_string())
}

fn decode_fixed<const N: usize>(encoded: &str, what: &str) -> Result<[u8; N]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| reject(&format!("{what} is not valid base64")))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| reject(&format!("{what} must be {N} bytes, got {}", v.len())))
}

impl PresenceAnnouncement {
    /// Build and sign the announcement for `identity` and this session's
    /// ratchet key.
    pub fn new(
        identity: &DeviceIdentity,
        ratchet_key: &[u8; 32],
        display_name: impl Into<String>,
    ) -> Self {
        let public_key = identity.encryption_public_key();
        let signature = identity.sign(&signed_payload(&public_key, ratchet_key));
        Self {
            display_name: display_name.into(),
            public_key: BASE64.encode(public_key),
            ratchet_key: BASE64.encode(ratchet_key),
            signature: BASE64.encode(signature.to_bytes()),
            verifying_key: BASE64.encode(identity.verifying_key().to_bytes()),
        }
    }

    /// Serialize as a tagged JSON handshake message.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&HandshakeMessage::Presence(self.clone()))
            .map_err(|e| SessionError::Frame(e.to_string()))
    }

    /// Parse a handshake message received from the relay.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match serde_json::from_slice(bytes) {
            Ok(HandshakeMessage::Presence(announcement)) => Ok(announcement),
            Err(e) => Err(reject(&format!("malformed announcement: {e}"))),
        }
    }

    /// Verify the announcement.
    ///
    /// * `expected_public_key` - the sender's key from the pairing token, if known
    /// * `own_public_key` - our encryption key; an announcement carrying it is
    ///   our own message reflected back
    pub fn verify(
        &self,
        expected_public_key: Option<&[u8; 32]>,
        own_public_key: &[u8; 32],
    ) -> Result<VerifiedPeer> {
        let public_key: [u8; 32] = decode_fixed(&self.public_key, "public_key")?;
        let ratchet_key: [u8; 32] = decode_fixed(&self.ratchet_key, "ratchet_key")?;
        let signature: [u8; 64] = decode_fixed(&self.signature, "signature")?;
        let verifying_key: [u8; 32] = decode_fixed(&self.verifying_key, "verifying_key")?;

        if &public_key == own_public_key {
            return Err(reject("announcement carries our own encryption key"));
        }

        let verifying_key = VerifyingKey::from_bytes(&verifying_key)
            .map_err(|_| reject("verifying_key is not a valid Ed25519 point"))?;
        verifying_key
            .verify_strict(
                &signed_payload(&public_key, &ratchet_key),
                &Signature::from_bytes(&signature),
            )
            .map_err(|_| reject("signature does not verify against the announced key"))?;

        if let Some(expected) = expected_public_key {
            if expected != &public_key {
                return Err(reject("announced key does not match the paired key"));
            }
        }

        Ok(VerifiedPeer {
            public_key,
            ratchet_key,
            verifying_key,
            display_name: self.display_name.clone(),
        })
    }
}
