//! Sealing of key-store records at rest.
//!
//! Each record is encrypted with AES-256-GCM under the store key and a fresh
//! random nonce. The record's file name and format version are bound in as
//! associated data, so a sealed record only opens under the name and version
//! it was written with. Copying `peers.enc` over `identity.enc`, or editing
//! the version field, fails authentication instead of feeding the wrong
//! bytes to the parser.
//!
//! # File Format
//!
//! ```json
//! { "nonce": "<base64>", "ciphertext": "<base64>", "version": <u8> }
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// AES-GCM nonce length.
const NONCE_SIZE: usize = 12;

/// Domain label prefixed to every record's associated data.
const RECORD_CONTEXT: &[u8] = b"botster-e2e/record";

/// A sealed key-store record as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedRecord {
    /// Base64 nonce.
    pub nonce: String,
    /// Base64 ciphertext with the GCM tag appended.
    pub ciphertext: String,
    /// Record format version, authenticated along with the record name.
    pub version: u8,
}

/// `context || record || version`. The context and version have fixed
/// lengths, so distinct (record, version) pairs never collide.
fn associated_data(record: &str, version: u8) -> Vec<u8> {
    let mut aad = Vec::with_capacity(RECORD_CONTEXT.len() + record.len() + 1);
    aad.extend_from_slice(RECORD_CONTEXT);
    aad.extend_from_slice(record.as_bytes());
    aad.push(version);
    aad
}

impl SealedRecord {
    /// Seal `plaintext` as version `version` of the record named `record`.
    pub fn seal(key: &[u8; 32], record: &str, version: u8, plaintext: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new(key.into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let aad = associated_data(record, version);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| anyhow::anyhow!("Failed to seal {record}"))?;

        Ok(Self {
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
            version,
        })
    }

    /// Open the record, which must have been sealed under the name `record`.
    pub fn open(&self, key: &[u8; 32], record: &str) -> Result<Zeroizing<Vec<u8>>> {
        let nonce_bytes = BASE64
            .decode(&self.nonce)
            .context("Invalid nonce encoding")?;
        if nonce_bytes.len() != NONCE_SIZE {
            anyhow::bail!("Invalid nonce length: {}", nonce_bytes.len());
        }
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .context("Invalid ciphertext encoding")?;

        let aad = associated_data(record, self.version);
        let plaintext = Aes256Gcm::new(key.into())
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                anyhow::anyhow!("{record} failed authentication (v{})", self.version)
            })?;
        Ok(Zeroizing::new(plaintext))
    }
}
