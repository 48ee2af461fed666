//! Transport seam to the untrusted relay.
//!
//! The relay delivers opaque messages in order per session and nothing
//! else. Connection management and reconnection live outside this crate;
//! [`ChannelRelay`] wires two sessions together in-process.

use tokio::sync::mpsc;

use crate::error::{Result, SessionError};

/// Outgoing side of the relay.
pub trait Relay: Send + Sync {
    /// Hand one opaque message to the relay for `session_id`.
    fn send(&self, session_id: &str, message: Vec<u8>) -> Result<()>;
}

/// One message as handed to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    /// Relay session / channel identifier.
    pub session_id: String,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

/// Relay backed by an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelRelay {
    tx: mpsc::UnboundedSender<RelayMessage>,
}

impl ChannelRelay {
    /// Create a relay and the receiver that observes everything sent on it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Relay for ChannelRelay {
    fn send(&self, session_id: &str, message: Vec<u8>) -> Result<()> {
        self.tx
            .send(RelayMessage {
                session_id: session_id.to_string(),
                payload: message,
            })
            .map_err(|_| SessionError::Transport("relay channel closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_delivered_in_order() {
        let (relay, mut rx) = ChannelRelay::new();
        relay.send("s1", vec![1]).unwrap();
        relay.send("s1", vec![2]).unwrap();

        assert_eq!(rx.try_recv().unwrap().payload, vec![1]);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.session_id, "s1");
        assert_eq!(second.payload, vec![2]);
    }

    #[test]
    fn test_closed_channel_is_transport_error() {
        let (relay, rx) = ChannelRelay::new();
        drop(rx);
        assert!(matches!(
            relay.send("s1", vec![0]),
            Err(SessionError::Transport(_))
        ));
    }
}
