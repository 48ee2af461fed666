//! Error taxonomy for the E2E session layer.
//!
//! Every failure the relay can provoke surfaces as a [`SessionError`] rather
//! than a panic. Callers use [`SessionError::is_recoverable`] to decide between
//! drop-and-continue and tearing the session down.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = SessionError> = std::result::Result<T, E>;

/// Errors produced while pairing, handshaking or exchanging terminal frames.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Out-of-band pairing data is missing or malformed.
    #[error("invalid pairing token: {0}")]
    InvalidPairingToken(String),

    /// Local key storage is unavailable.
    #[error("key storage error: {0}")]
    Storage(String),

    /// A single message failed to authenticate or decrypt.
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// Bytes from the relay do not parse as an envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The presence announcement did not bind to the expected keys.
    #[error("presence verification failed: {0}")]
    PresenceMismatch(String),

    /// The peer key is a low-order point or produced a non-contributory secret.
    #[error("peer public key rejected: {0}")]
    WeakPeerKey(String),

    /// The session cannot perform this operation in its current state.
    #[error("session not ready: {0}")]
    NotReady(String),

    /// Repeated decryption failures; both ratchets have diverged.
    #[error("session desynchronized after {0} consecutive decryption failures")]
    Desynchronized(u32),

    /// The relay refused an outgoing message.
    #[error("transport error: {0}")]
    Transport(String),

    /// A decrypted payload is not a terminal frame.
    #[error("invalid terminal frame: {0}")]
    Frame(String),
}

impl SessionError {
    /// Whether the session may continue after this error.
    ///
    /// Per-message faults are dropped; everything else ends the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Decrypt(_) | Self::MalformedEnvelope(_) | Self::Frame(_)
        )
    }

    /// Actionable text for the person at the keyboard.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidPairingToken(_) | Self::WeakPeerKey(_) => {
                "The pairing code could not be used. Re-scan the pairing code from the CLI."
            }
            Self::Storage(_) => {
                "Local key storage is unavailable. Check keychain access and the config directory, then retry."
            }
            Self::PresenceMismatch(_) => {
                "The peer's identity could not be verified and the connection was refused. \
                 Someone may be interfering with the relay. Re-scan the pairing code."
            }
            Self::Desynchronized(_) => {
                "The encrypted session lost sync and was closed. Reconnect to start a new session."
            }
            Self::Transport(_) => "The relay connection failed. Reconnect to continue.",
            Self::NotReady(_) => "The encrypted session is not ready yet.",
            Self::Decrypt(_) | Self::MalformedEnvelope(_) | Self::Frame(_) => {
                "A message could not be decrypted and was skipped."
            }
        }
    }
}

impl From<anyhow::Error> for SessionError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}
