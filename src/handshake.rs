//! Session establishment.
//!
//! Order of operations, on both sides:
//! 1. send our signed [`PresenceAnnouncement`], carrying a ratchet key
//!    generated for this session only
//! 2. verify the peer's announcement (signature, and the paired key when known)
//! 3. only then derive the shared secret and initialize the ratchet from it
//!    and both announced ratchet keys
//! 4. cache the peer key in the [`KeyStore`]
//! 5. hand back a [`TerminalSession`]
//!
//! The browser always knows the CLI's key from the pairing token, so a relay
//! substituting its own key fails at step 2 before any secret exists. The
//! CLI then opens the ratchet with a `ping`, which gives the browser its
//! sending chain.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::frame::TerminalFrame;
use crate::identity::DeviceIdentity;
use crate::key_exchange::derive_shared_secret;
use crate::keystore::{KeyStore, PairedPeerKey};
use crate::pairing::PairingToken;
use crate::presence::PresenceAnnouncement;
use crate::ratchet::{RatchetKeyPair, RatchetSession};
use crate::relay::Relay;
use crate::terminal::{short_id, Role, TerminalSession};

/// One side of a pending session.
#[derive(Debug)]
pub struct Handshake {
    identity: Arc<DeviceIdentity>,
    role: Role,
    session_id: String,
    expected_peer: Option<[u8; 32]>,
    display_name: String,
    ratchet_key: RatchetKeyPair,
    config: Config,
}

impl Handshake {
    /// Start a handshake for `role` on relay session `session_id`.
    pub fn new(
        identity: Arc<DeviceIdentity>,
        role: Role,
        session_id: impl Into<String>,
        config: Config,
    ) -> Self {
        Self {
            identity,
            role,
            session_id: session_id.into(),
            expected_peer: None,
            display_name: config.display_name.clone(),
            ratchet_key: RatchetKeyPair::generate(),
            config,
        }
    }

    /// Browser side of a scanned pairing token.
    pub fn from_pairing_token(
        identity: Arc<DeviceIdentity>,
        token: &PairingToken,
        config: Config,
    ) -> Self {
        Self::new(identity, Role::Browser, token.session_id.clone(), config)
            .expect_peer_key(token.peer_public_key)
    }

    /// Require the peer to announce exactly this encryption key.
    pub fn expect_peer_key(mut self, key: [u8; 32]) -> Self {
        self.expected_peer = Some(key);
        self
    }

    /// Override the announced display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Relay session identifier.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Our signed announcement.
    pub fn announcement(&self) -> PresenceAnnouncement {
        PresenceAnnouncement::new(
            &self.identity,
            self.ratchet_key.public_key(),
            self.display_name.clone(),
        )
    }

    /// Send our announcement over the relay.
    pub fn announce(&self, relay: &dyn Relay) -> Result<()> {
        relay.send(&self.session_id, self.announcement().to_bytes()?)?;
        log::debug!(
            "Sent presence announcement for session {} as {}",
            short_id(&self.session_id),
            self.role
        );
        Ok(())
    }

    /// Finish the handshake with the peer's announcement.
    ///
    /// Nothing is derived or stored unless the announcement verifies.
    pub fn complete(
        self,
        peer_message: &[u8],
        store: &dyn KeyStore,
        relay: Arc<dyn Relay>,
    ) -> Result<TerminalSession> {
        let announcement = PresenceAnnouncement::from_bytes(peer_message)?;
        let own_key = self.identity.encryption_public_key();
        let peer = announcement.verify(self.expected_peer.as_ref(), &own_key)?;

        let shared = derive_shared_secret(&peer.public_key, self.identity.encryption_secret())?;
        let limits = self.config.ratchet_limits();
        let ratchet = if self.role.is_initiator() {
            RatchetSession::initiator(
                shared.as_bytes(),
                self.ratchet_key,
                &peer.ratchet_key,
                limits,
            )?
        } else {
            RatchetSession::responder(
                shared.as_bytes(),
                self.ratchet_key,
                &peer.ratchet_key,
                limits,
            )?
        };
        drop(shared);

        store.put_peer_key(PairedPeerKey::new(peer.public_key, &peer.display_name))?;

        log::info!(
            "E2E session {} established as {} with peer {} ({})",
            short_id(&self.session_id),
            self.role,
            peer.fingerprint(),
            peer.display_name
        );

        let mut session = TerminalSession::new(
            self.session_id,
            self.role,
            peer,
            ratchet,
            relay,
            &self.config,
        );
        if self.role.is_initiator() {
            session.send_frame(&TerminalFrame::Ping)?;
        }
        Ok(session)
    }
}
