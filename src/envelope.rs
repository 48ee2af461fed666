//! Envelope codec: the opaque byte messages the relay forwards.
//!
//! Each application message travels as one self-delimiting binary envelope
//! (big-endian):
//!
//! ```text
//! version(1) | ratchet_key(32) | previous_chain_length(4) | counter(4)
//! | nonce(12) | tag(16) | ciphertext_len(4) | ciphertext
//! ```
//!
//! The first 41 bytes are the ratchet header; they are bound into the AEAD
//! as associated data, so the relay cannot rewrite them. Everything coming
//! from the relay is untrusted: decoding never panics and every failure is a
//! [`SessionError::MalformedEnvelope`].

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::config::DEFAULT_MAX_ENVELOPE_SIZE;
use crate::error::{Result, SessionError};

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 3;

pub mod binary_format {
    //! Byte offsets and sizes of the envelope layout.

    /// Byte offset: format version (1 byte).
    pub const VERSION_OFFSET: usize = 0;
    /// Byte offset: sender ratchet public key (32 bytes).
    pub const RATCHET_KEY_OFFSET: usize = 1;
    /// Byte offset: previous sending chain length (4 bytes BE).
    pub const PREVIOUS_CHAIN_LENGTH_OFFSET: usize = 33;
    /// Byte offset: message counter in the current chain (4 bytes BE).
    pub const COUNTER_OFFSET: usize = 37;
    /// Serialized header size; the AEAD associated data.
    pub const HEADER_SIZE: usize = 41;
    /// Byte offset: AEAD nonce (12 bytes).
    pub const NONCE_OFFSET: usize = 41;
    /// Byte offset: AEAD tag (16 bytes).
    pub const TAG_OFFSET: usize = 53;
    /// Byte offset: ciphertext length (4 bytes BE).
    pub const CIPHERTEXT_LEN_OFFSET: usize = 69;
    /// Byte offset: ciphertext.
    pub const CIPHERTEXT_OFFSET: usize = 73;

    /// Size of an X25519 ratchet public key.
    pub const RATCHET_KEY_SIZE: usize = 32;
    /// Size of the AES-GCM nonce.
    pub const NONCE_SIZE: usize = 12;
    /// Size of the AES-GCM tag.
    pub const TAG_SIZE: usize = 16;
}

/// Ratchet metadata the receiver needs to locate the message key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key (the chain epoch).
    pub ratchet_key: [u8; binary_format::RATCHET_KEY_SIZE],
    /// Messages sent in the sender's previous chain.
    pub previous_chain_length: u32,
    /// Index of this message in the current chain.
    pub counter: u32,
}

impl RatchetHeader {
    /// Canonical header bytes, used as AEAD associated data.
    pub fn to_bytes(&self) -> [u8; binary_format::HEADER_SIZE] {
        use binary_format::*;

        let mut buf = [0u8; HEADER_SIZE];
        buf[VERSION_OFFSET] = ENVELOPE_VERSION;
        buf[RATCHET_KEY_OFFSET..RATCHET_KEY_OFFSET + RATCHET_KEY_SIZE]
            .copy_from_slice(&self.ratchet_key);
        buf[PREVIOUS_CHAIN_LENGTH_OFFSET..PREVIOUS_CHAIN_LENGTH_OFFSET + 4]
            .copy_from_slice(&self.previous_chain_length.to_be_bytes());
        buf[COUNTER_OFFSET..COUNTER_OFFSET + 4].copy_from_slice(&self.counter.to_be_bytes());
        buf
    }
}

/// One encrypted message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Ratchet header.
    pub header: RatchetHeader,
    /// AEAD nonce.
    pub nonce: [u8; binary_format::NONCE_SIZE],
    /// AEAD authentication tag.
    pub tag: [u8; binary_format::TAG_SIZE],
    /// Encrypted payload, without the tag.
    pub ciphertext: Vec<u8>,
}

fn malformed(msg: impl Into<String>) -> SessionError {
    SessionError::MalformedEnvelope(msg.into())
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N]> {
    bytes
        .get(offset..offset + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| malformed(format!("truncated at offset {offset}")))
}

impl Envelope {
    /// Serialize to the binary wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        use binary_format::*;

        let mut buf = Vec::with_capacity(CIPHERTEXT_OFFSET + self.ciphertext.len());
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.tag);
        // Ciphertext length is bounded by max_envelope_size, far below u32::MAX.
        buf.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.ciphertext);
        buf
    }

    /// Parse the binary wire format with the default size limit.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_bytes_with_limit(bytes, DEFAULT_MAX_ENVELOPE_SIZE)
    }

    /// Parse the binary wire format, rejecting input above `max_size` bytes.
    pub fn from_bytes_with_limit(bytes: &[u8], max_size: usize) -> Result<Self> {
        use binary_format::*;

        if bytes.len() > max_size {
            return Err(malformed(format!(
                "envelope too large: {} > {max_size} bytes",
                bytes.len()
            )));
        }
        if bytes.len() < CIPHERTEXT_OFFSET {
            return Err(malformed(format!(
                "envelope too short: {} < {CIPHERTEXT_OFFSET} bytes",
                bytes.len()
            )));
        }

        let version = bytes[VERSION_OFFSET];
        if version != ENVELOPE_VERSION {
            return Err(malformed(format!("unsupported envelope version {version}")));
        }

        let header = RatchetHeader {
            ratchet_key: read_array(bytes, RATCHET_KEY_OFFSET)?,
            previous_chain_length: u32::from_be_bytes(read_array(
                bytes,
                PREVIOUS_CHAIN_LENGTH_OFFSET,
            )?),
            counter: u32::from_be_bytes(read_array(bytes, COUNTER_OFFSET)?),
        };
        let nonce = read_array(bytes, NONCE_OFFSET)?;
        let tag = read_array(bytes, TAG_OFFSET)?;

        let declared = u32::from_be_bytes(read_array(bytes, CIPHERTEXT_LEN_OFFSET)?) as usize;
        let actual = bytes.len() - CIPHERTEXT_OFFSET;
        if declared != actual {
            return Err(malformed(format!(
                "ciphertext length mismatch: declared {declared}, got {actual}"
            )));
        }

        Ok(Self {
            header,
            nonce,
            tag,
            ciphertext: bytes[CIPHERTEXT_OFFSET..].to_vec(),
        })
    }

    /// Serialize for text-only relays (URL-safe base64, unpadded).
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_bytes())
    }

    /// Parse the base64 form produced by [`Envelope::to_base64`].
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim().trim_end_matches('='))
            .map_err(|e| malformed(format!("invalid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }
}
