//! Out-of-band pairing.
//!
//! The CLI renders a pairing URL whose fragment carries its long-term
//! encryption key:
//!
//! ```text
//! https://trybotster.com/hubs/abc#key=<base64url>&session=<id>
//! ```
//!
//! Browsers never send the fragment to the server, so the relay never learns
//! the key it would need to impersonate the CLI. Everything downstream trusts
//! this key; tokens must only be parsed from that out-of-band channel.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

use crate::error::{Result, SessionError};

/// Length of a raw X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Data extracted from a pairing token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingToken {
    /// Peer long-term encryption public key.
    pub peer_public_key: [u8; PUBLIC_KEY_LEN],
    /// Relay session / channel identifier.
    pub session_id: String,
}

impl PairingToken {
    /// Fingerprint of the paired key, for display next to the QR code.
    pub fn fingerprint(&self) -> String {
        compute_fingerprint(&self.peer_public_key)
    }
}

/// Parse a pairing token from a full URL or a bare fragment.
pub fn parse_pairing_token(raw: &str) -> Result<PairingToken> {
    let raw = raw.trim();
    let fragment = match raw.split_once('#') {
        Some((_, fragment)) => fragment,
        None => raw,
    };

    let mut key = None;
    let mut session = None;
    for pair in fragment.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        match name {
            "key" => key = Some(value),
            "session" => session = Some(value),
            _ => log::debug!("Ignoring unknown pairing parameter '{name}'"),
        }
    }

    let key = key.ok_or_else(|| SessionError::InvalidPairingToken("missing 'key'".into()))?;
    let session_id = session
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SessionError::InvalidPairingToken("missing 'session'".into()))?;

    let peer_public_key = decode_public_key(key)?;

    Ok(PairingToken {
        peer_public_key,
        session_id: session_id.to_string(),
    })
}

/// Decode a base64url public key, tolerating padding and the standard alphabet.
fn decode_public_key(encoded: &str) -> Result<[u8; PUBLIC_KEY_LEN]> {
    let normalized: String = encoded
        .replace("%3D", "")
        .replace("%3d", "")
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();

    let bytes = URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|e| SessionError::InvalidPairingToken(format!("key is not base64url: {e}")))?;

    bytes.try_into().map_err(|v: Vec<u8>| {
        SessionError::InvalidPairingToken(format!(
            "key must be {PUBLIC_KEY_LEN} bytes, got {}",
            v.len()
        ))
    })
}

/// Build the pairing URL for a local public key.
///
/// Any fragment already on `base_url` is replaced.
pub fn pairing_url(base_url: &str, session_id: &str, public_key: &[u8; PUBLIC_KEY_LEN]) -> String {
    let base = base_url.split('#').next().unwrap_or(base_url);
    format!(
        "{}#key={}&session={}",
        base,
        URL_SAFE_NO_PAD.encode(public_key),
        session_id
    )
}

/// Compute a human-verifiable fingerprint of a public key.
///
/// The fingerprint is the first 8 bytes of SHA256(public_key) as
/// colon-separated hex octets.
pub fn compute_fingerprint(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);
    hash[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE};
    use rand::RngCore;
    use std::collections::HashSet;

    fn random_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_parse_full_url() {
        let key = random_key();
        let url = pairing_url("https://trybotster.com/hubs/42", "hub-42", &key);

        let token = parse_pairing_token(&url).unwrap();
        assert_eq!(token.peer_public_key, key);
        assert_eq!(token.session_id, "hub-42");
    }

    #[test]
    fn test_parse_bare_fragment_with_padding() {
        let key = random_key();
        let fragment = format!("#session=s1&key={}", URL_SAFE.encode(key));
        assert!(URL_SAFE.encode(key).ends_with('='));

        let token = parse_pairing_token(&fragment).unwrap();
        assert_eq!(token.peer_public_key, key);
        assert_eq!(token.session_id, "s1");
    }

    #[test]
    fn test_parse_standard_alphabet_and_encoded_padding() {
        let key = [0xfbu8; 32];
        let encoded = STANDARD.encode(key).replace('=', "%3D");
        let token = parse_pairing_token(&format!("key={encoded}&session=x")).unwrap();
        assert_eq!(token.peer_public_key, key);
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        let short = URL_SAFE_NO_PAD.encode([1u8; 31]);
        let err = parse_pairing_token(&format!("key={short}&session=s")).unwrap_err();
        assert!(matches!(err, SessionError::InvalidPairingToken(_)));
    }

    #[test]
    fn test_missing_parts_rejected() {
        let key = URL_SAFE_NO_PAD.encode([1u8; 32]);
        assert!(matches!(
            parse_pairing_token(&format!("key={key}")),
            Err(SessionError::InvalidPairingToken(_))
        ));
        assert!(matches!(
            parse_pairing_token(&format!("key={key}&session=")),
            Err(SessionError::InvalidPairingToken(_))
        ));
        assert!(matches!(
            parse_pairing_token("session=abc"),
            Err(SessionError::InvalidPairingToken(_))
        ));
        assert!(matches!(
            parse_pairing_token("key=!!!&session=abc"),
            Err(SessionError::InvalidPairingToken(_))
        ));
    }

    #[test]
    fn test_pairing_url_replaces_existing_fragment() {
        let url = pairing_url("https://example.com/a#old=1", "s", &[0u8; 32]);
        assert!(url.starts_with("https://example.com/a#key="));
        assert!(!url.contains("old=1"));
    }

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = compute_fingerprint(&random_key());

        let parts: Vec<&str> = fingerprint.split(':').collect();
        assert_eq!(parts.len(), 8);
        for part in parts {
            assert_eq!(part.len(), 2);
            assert!(part.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let key = random_key();
        assert_eq!(compute_fingerprint(&key), compute_fingerprint(&key));
    }

    #[test]
    fn test_fingerprints_do_not_collide_over_10k_keys() {
        let mut seen = HashSet::new();
        let mut keys = HashSet::new();
        for _ in 0..10_000 {
            let key = random_key();
            if keys.insert(key) {
                assert!(seen.insert(compute_fingerprint(&key)));
            }
        }
    }
}
