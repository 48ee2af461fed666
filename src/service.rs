//! Session Service - serialized access to one terminal session.
//!
//! The ratchet is strictly sequential: two concurrent encrypts (or decrypts)
//! would fork the chain. This service gives the [`TerminalSession`] to a
//! single tokio task and exposes a cloneable handle; user input and relay
//! deliveries become requests processed one at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐        ┌─────────────────────────────┐
//! │ Keyboard /   │──req──▶│       SESSION TASK          │
//! │ PTY reader   │◀──res──│                             │
//! └──────────────┘        │  TerminalSession            │──▶ Relay
//!                         │  process_requests() loop    │
//! ┌──────────────┐        │                             │
//! │ Relay        │──req──▶│                             │──▶ TerminalEvent
//! │ reader       │◀──res──│                             │
//! └──────────────┘        └─────────────────────────────┘
//! ```
//!
//! Every way out of the loop (shutdown request, fatal error, peer close,
//! last handle dropped) zeroizes the session before the task ends.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, SessionError};
use crate::terminal::{short_id, TerminalEvent, TerminalSession};

/// Requests processed by the session task.
///
/// Each variant includes a oneshot channel for returning the result.
pub enum SessionRequest {
    /// Send keystrokes (browser).
    SendInput {
        /// Text to send.
        data: String,
        /// Channel to send the result.
        reply: oneshot::Sender<Result<()>>,
    },

    /// Send a resize (browser).
    SendResize {
        /// Columns.
        cols: u16,
        /// Rows.
        rows: u16,
        /// Channel to send the result.
        reply: oneshot::Sender<Result<()>>,
    },

    /// Send screen output (CLI).
    SendOutput {
        /// Text to send.
        data: String,
        /// Channel to send the result.
        reply: oneshot::Sender<Result<()>>,
    },

    /// A message arrived from the relay.
    Deliver {
        /// Opaque relay payload.
        message: Vec<u8>,
        /// Channel to send the result.
        reply: oneshot::Sender<Result<()>>,
    },

    /// Close the session.
    Shutdown {
        /// Reason passed to the peer.
        reason: Option<String>,
    },
}

impl std::fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendInput { data, .. } => f
                .debug_struct("SendInput")
                .field("len", &data.len())
                .finish_non_exhaustive(),
            Self::SendResize { cols, rows, .. } => f
                .debug_struct("SendResize")
                .field("cols", cols)
                .field("rows", rows)
                .finish_non_exhaustive(),
            Self::SendOutput { data, .. } => f
                .debug_struct("SendOutput")
                .field("len", &data.len())
                .finish_non_exhaustive(),
            Self::Deliver { message, .. } => f
                .debug_struct("Deliver")
                .field("len", &message.len())
                .finish_non_exhaustive(),
            Self::Shutdown { reason } => f
                .debug_struct("Shutdown")
                .field("reason", reason)
                .finish(),
        }
    }
}

fn service_gone() -> SessionError {
    SessionError::NotReady("session service shut down".into())
}

/// Handle for sending requests to the session task.
///
/// This is Send + Sync and can be cloned and shared across tasks.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionRequest>,
}

impl SessionHandle {
    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<()>>) -> SessionRequest,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| service_gone())?;

        reply_rx.await.map_err(|_| service_gone())?
    }

    /// Send keystrokes to the CLI.
    pub async fn send_input(&self, data: &str) -> Result<()> {
        let data = data.to_string();
        self.request(|reply| SessionRequest::SendInput { data, reply })
            .await
    }

    /// Send a terminal resize to the CLI.
    pub async fn send_resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.request(|reply| SessionRequest::SendResize { cols, rows, reply })
            .await
    }

    /// Send screen output to the browser.
    pub async fn send_output(&self, data: &str) -> Result<()> {
        let data = data.to_string();
        self.request(|reply| SessionRequest::SendOutput { data, reply })
            .await
    }

    /// Hand a relay message to the session.
    ///
    /// Recoverable errors (see [`SessionError::is_recoverable`]) leave the
    /// session running.
    pub async fn deliver(&self, message: Vec<u8>) -> Result<()> {
        self.request(|reply| SessionRequest::Deliver { message, reply })
            .await
    }

    /// Close the session, telling the peer why.
    pub async fn shutdown(&self, reason: Option<&str>) -> Result<()> {
        self.tx
            .send(SessionRequest::Shutdown {
                reason: reason.map(str::to_string),
            })
            .await
            .map_err(|_| service_gone())
    }

    /// Whether the session task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owner of a running session task.
#[derive(Debug)]
pub struct SessionService;

impl SessionService {
    /// Spawn the session task on the current tokio runtime.
    ///
    /// Events for the UI go to `events`. The returned join handle yields the
    /// torn-down session once the task ends.
    pub fn start(
        session: TerminalSession,
        events: mpsc::UnboundedSender<TerminalEvent>,
    ) -> (SessionHandle, JoinHandle<TerminalSession>) {
        let (tx, rx) = mpsc::channel::<SessionRequest>(256);
        log::info!(
            "Started session service for {} as {}",
            short_id(session.session_id()),
            session.role()
        );
        let task = tokio::spawn(Self::run_service(session, rx, events));
        (SessionHandle { tx }, task)
    }

    /// Main service loop - processes requests until the session ends.
    async fn run_service(
        mut session: TerminalSession,
        mut rx: mpsc::Receiver<SessionRequest>,
        events: mpsc::UnboundedSender<TerminalEvent>,
    ) -> TerminalSession {
        let mut close_reason = None;

        while let Some(request) = rx.recv().await {
            match request {
                SessionRequest::SendInput { data, reply } => {
                    let _ = reply.send(session.send_input(&data));
                }
                SessionRequest::SendResize { cols, rows, reply } => {
                    let _ = reply.send(session.send_resize(cols, rows));
                }
                SessionRequest::SendOutput { data, reply } => {
                    let _ = reply.send(session.send_output(&data));
                }
                SessionRequest::Deliver { message, reply } => {
                    let result = match session.on_transport_message(&message) {
                        Ok(Some(event)) => {
                            if events.send(event).is_err() {
                                log::debug!("Event receiver dropped, discarding event");
                            }
                            Ok(())
                        }
                        Ok(None) => Ok(()),
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(result);
                }
                SessionRequest::Shutdown { reason } => {
                    log::info!("Session service shutting down");
                    close_reason = reason;
                    break;
                }
            }

            if session.is_closed() {
                break;
            }
        }

        session.close(close_reason.as_deref());
        log::debug!(
            "Session service for {} stopped",
            short_id(session.session_id())
        );
        session
    }
}
