//! Botster E2E - end-to-end session security for the browser <-> CLI
//! terminal relay.
//!
//! The relay forwards opaque bytes between a browser and a CLI and is
//! treated as untrusted. This crate makes sure it can neither read nor
//! silently alter terminal traffic.
//!
//! # Architecture
//!
//! - **Pairing** - the CLI's key travels out of band in a URL fragment
//! - **Presence** - each side signs its encryption key; verified before any secret is derived
//! - **Key exchange** - X25519 between long-term keys, low-order points rejected
//! - **Ratchet** - double ratchet with bounded out-of-order tolerance
//! - **Envelope** - fixed binary layout around each AES-256-GCM message
//! - **Terminal session** - typed frames, role filtering, teardown and zeroization
//!
//! # Modules
//!
//! - [`pairing`] - pairing token parsing and URL rendering
//! - [`keystore`] - device identity and paired peer key persistence
//! - [`handshake`] - presence exchange through to a live session
//! - [`ratchet`] - message encryption state
//! - [`terminal`] - session lifecycle over a [`relay::Relay`]
//! - [`service`] - serialized access to a session from async tasks

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod env;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod identity;
pub mod key_exchange;
pub mod keyring;
pub mod keystore;
pub mod pairing;
pub mod presence;
pub mod ratchet;
pub mod relay;
pub mod service;
pub mod terminal;

// Re-export commonly used types
pub use config::Config;
pub use envelope::{Envelope, RatchetHeader};
pub use error::{Result, SessionError};
pub use frame::TerminalFrame;
pub use handshake::Handshake;
pub use identity::DeviceIdentity;
pub use keystore::{FileKeyStore, KeyStore, MemoryKeyStore, PairedPeerKey};
pub use pairing::{parse_pairing_token, pairing_url, PairingToken};
pub use presence::{PresenceAnnouncement, VerifiedPeer};
pub use ratchet::{RatchetKeyPair, RatchetLimits, RatchetSession};
pub use relay::{ChannelRelay, Relay, RelayMessage};
pub use service::{SessionHandle, SessionService};
pub use terminal::{Role, TerminalEvent, TerminalSession};
