//! Terminal session: the application layer above the ratchet.
//!
//! Outgoing frames are serialized, encrypted and handed to the relay.
//! Incoming relay messages are decoded, decrypted and dispatched by frame
//! tag, filtered by *our* role rather than by anything the peer claims, so
//! a relay echoing our own ciphertext back never shows up as peer output.
//!
//! Failure policy:
//! - malformed envelope, undecryptable message, bad frame: dropped, the
//!   error is returned and the session continues
//! - `max_decrypt_failures` consecutive decryption failures: the session is
//!   torn down with [`SessionError::Desynchronized`]
//! - relay refused a message, or the peer sent `close`: torn down
//!
//! Teardown always zeroizes the ratchet before anything else.

use std::sync::Arc;
use zeroize::Zeroizing;

use crate::config::Config;
use crate::envelope::Envelope;
use crate::error::{Result, SessionError};
use crate::frame::TerminalFrame;
use crate::presence::VerifiedPeer;
use crate::ratchet::RatchetSession;
use crate::relay::Relay;

/// Which end of the terminal this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Owns the PTY; sends output, receives input. Ratchet initiator.
    Cli,
    /// Renders the terminal; sends input, receives output. Ratchet responder.
    Browser,
}

impl Role {
    /// Whether this role starts the ratchet's sending chain.
    pub fn is_initiator(self) -> bool {
        matches!(self, Self::Cli)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "cli"),
            Self::Browser => write!(f, "browser"),
        }
    }
}

/// Something the UI collaborator must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// Keystrokes to write to the PTY (CLI only).
    Input(String),
    /// Output to render (browser only).
    Output(String),
    /// Resize the PTY (CLI only).
    Resize {
        /// Columns.
        cols: u16,
        /// Rows.
        rows: u16,
    },
    /// The peer closed the session; key material is already wiped.
    Closed {
        /// Reason given by the peer, if any.
        reason: Option<String>,
    },
}

/// First characters of a session id, for logs.
pub(crate) fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// An established, authenticated terminal session.
pub struct TerminalSession {
    session_id: String,
    role: Role,
    peer: VerifiedPeer,
    ratchet: RatchetSession,
    relay: Arc<dyn Relay>,
    consecutive_failures: u32,
    max_decrypt_failures: u32,
    max_envelope_size: usize,
    closed: bool,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("session_id", &short_id(&self.session_id))
            .field("role", &self.role)
            .field("peer", &self.peer.fingerprint())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl TerminalSession {
    /// Wrap an initialized ratchet for a verified peer.
    pub fn new(
        session_id: impl Into<String>,
        role: Role,
        peer: VerifiedPeer,
        ratchet: RatchetSession,
        relay: Arc<dyn Relay>,
        config: &Config,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            role,
            peer,
            ratchet,
            relay,
            consecutive_failures: 0,
            max_decrypt_failures: config.max_decrypt_failures.max(1),
            max_envelope_size: config.max_envelope_size,
            closed: false,
        }
    }

    /// Relay session identifier.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The authenticated peer.
    pub fn peer(&self) -> &VerifiedPeer {
        &self.peer
    }

    /// Whether the session has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the ratchet key material has been wiped.
    pub fn is_zeroized(&self) -> bool {
        self.ratchet.is_zeroized()
    }

    /// Whether we can encrypt yet (a browser waits for the CLI's first frame).
    pub fn can_send(&self) -> bool {
        !self.closed && self.ratchet.can_send()
    }

    /// Decryption failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Send keystrokes (browser only).
    pub fn send_input(&mut self, data: &str) -> Result<()> {
        self.require_role(Role::Browser, "input")?;
        self.send_frame(&TerminalFrame::Input {
            data: data.to_string(),
        })
    }

    /// Send a terminal resize (browser only).
    pub fn send_resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.require_role(Role::Browser, "resize")?;
        self.send_frame(&TerminalFrame::Resize { cols, rows })
    }

    /// Send screen output (CLI only).
    pub fn send_output(&mut self, data: &str) -> Result<()> {
        self.require_role(Role::Cli, "output")?;
        self.send_frame(&TerminalFrame::Output {
            data: data.to_string(),
        })
    }

    /// Send a liveness check.
    pub fn ping(&mut self) -> Result<()> {
        self.send_frame(&TerminalFrame::Ping)
    }

    fn require_role(&self, role: Role, kind: &str) -> Result<()> {
        if self.role != role {
            return Err(SessionError::NotReady(format!(
                "{} sessions do not send {kind} frames",
                self.role
            )));
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SessionError::NotReady("session is closed".into()));
        }
        Ok(())
    }

    /// Encrypt a frame and hand it to the relay.
    pub(crate) fn send_frame(&mut self, frame: &TerminalFrame) -> Result<()> {
        self.ensure_open()?;
        let plaintext = Zeroizing::new(frame.to_bytes()?);
        let envelope = self.ratchet.encrypt(&plaintext)?;

        if let Err(e) = self.relay.send(&self.session_id, envelope.to_bytes()) {
            log::error!(
                "Relay refused {} frame for session {}: {e}",
                frame.kind(),
                short_id(&self.session_id)
            );
            self.teardown();
            return Err(e);
        }
        log::trace!("Sent {} frame", frame.kind());
        Ok(())
    }

    /// Process one opaque message from the relay.
    ///
    /// `Ok(None)` means the message was consumed without anything for the
    /// UI (control frames, frames our role does not accept).
    pub fn on_transport_message(&mut self, message: &[u8]) -> Result<Option<TerminalEvent>> {
        self.ensure_open()?;

        let envelope = match Envelope::from_bytes_with_limit(message, self.max_envelope_size) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Dropping relay message: {e}");
                return Err(e);
            }
        };

        let plaintext = match self.ratchet.decrypt(&envelope) {
            Ok(plaintext) => {
                self.consecutive_failures = 0;
                Zeroizing::new(plaintext)
            }
            Err(e @ SessionError::Decrypt(_)) => return Err(self.record_decrypt_failure(e)),
            Err(e) => return Err(e),
        };

        let frame = match TerminalFrame::from_bytes(&plaintext) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return Err(e);
            }
        };
        self.dispatch(frame)
    }

    fn record_decrypt_failure(&mut self, err: SessionError) -> SessionError {
        self.consecutive_failures += 1;
        log::warn!(
            "Dropping undecryptable message ({}/{}): {err}",
            self.consecutive_failures,
            self.max_decrypt_failures
        );
        if self.consecutive_failures >= self.max_decrypt_failures {
            log::error!(
                "Session {} desynchronized, tearing down",
                short_id(&self.session_id)
            );
            self.teardown();
            return SessionError::Desynchronized(self.consecutive_failures);
        }
        err
    }

    fn dispatch(&mut self, frame: TerminalFrame) -> Result<Option<TerminalEvent>> {
        match (self.role, frame) {
            (_, TerminalFrame::Ping) => {
                self.send_frame(&TerminalFrame::Pong)?;
                Ok(None)
            }
            (_, TerminalFrame::Pong) => {
                log::trace!("Received pong");
                Ok(None)
            }
            (_, TerminalFrame::Close { reason }) => {
                log::info!(
                    "Peer closed session {}: {}",
                    short_id(&self.session_id),
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.teardown();
                Ok(Some(TerminalEvent::Closed { reason }))
            }
            (_, TerminalFrame::Unrecognized) => {
                log::debug!("Ignoring unrecognized frame type");
                Ok(None)
            }
            (Role::Cli, TerminalFrame::Input { data }) => Ok(Some(TerminalEvent::Input(data))),
            (Role::Cli, TerminalFrame::Resize { cols, rows }) => {
                Ok(Some(TerminalEvent::Resize { cols, rows }))
            }
            (Role::Browser, TerminalFrame::Output { data }) => {
                Ok(Some(TerminalEvent::Output(data)))
            }
            (role, frame) => {
                log::warn!("Dropping {} frame: {role} sessions do not accept it", frame.kind());
                Ok(None)
            }
        }
    }

    /// Close the session, telling the peer if possible.
    pub fn close(&mut self, reason: Option<&str>) {
        if self.closed {
            return;
        }
        if self.ratchet.can_send() {
            let frame = TerminalFrame::Close {
                reason: reason.map(str::to_string),
            };
            if let Err(e) = self.send_frame(&frame) {
                log::debug!("Could not notify peer of close: {e}");
            }
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.ratchet.zeroize();
        self.closed = true;
        log::info!(
            "Session {} closed, key material zeroized",
            short_id(&self.session_id)
        );
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
