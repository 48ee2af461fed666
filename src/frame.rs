//! Terminal frames: the plaintext carried inside every envelope.
//!
//! # Message Types
//!
//! - Browser → CLI: `input`, `resize`
//! - CLI → Browser: `output`
//! - Either direction: `ping`, `pong`, `close`
//!
//! Unknown `type` tags decode to [`TerminalFrame::Unrecognized`] so a newer
//! peer never crashes an older one.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Application payload before encryption / after decryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TerminalFrame {
    /// Keystrokes from the browser.
    #[serde(rename = "input")]
    Input {
        /// Raw keystrokes, escape sequences included.
        data: String,
    },
    /// Screen output from the CLI.
    #[serde(rename = "output")]
    Output {
        /// Terminal bytes as UTF-8 text.
        data: String,
    },
    /// Browser terminal size changed.
    #[serde(rename = "resize")]
    Resize {
        /// Columns.
        cols: u16,
        /// Rows.
        rows: u16,
    },
    /// Liveness check; answered with `pong`.
    #[serde(rename = "ping")]
    Ping,
    /// Answer to `ping`.
    #[serde(rename = "pong")]
    Pong,
    /// Peer is ending the session.
    #[serde(rename = "close")]
    Close {
        /// Shown to the user on the other side.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Any tag this version does not know.
    #[serde(other)]
    Unrecognized,
}

impl TerminalFrame {
    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input { .. } => "input",
            Self::Output { .. } => "output",
            Self::Resize { .. } => "resize",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Close { .. } => "close",
            Self::Unrecognized => "unrecognized",
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SessionError::Frame(e.to_string()))
    }

    /// Parse JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SessionError::Frame(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_serialization() {
        let frame = TerminalFrame::Input {
            data: "ls\n".to_string(),
        };
        let json = String::from_utf8(frame.to_bytes().unwrap()).unwrap();
        assert!(json.contains(r#""type":"input""#));
        assert!(json.contains(r#""data":"ls\n""#));
    }

    #[test]
    fn test_resize_parsing() {
        let frame =
            TerminalFrame::from_bytes(br#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(frame, TerminalFrame::Resize { cols: 120, rows: 40 });
    }

    #[test]
    fn test_close_reason_optional() {
        assert_eq!(
            TerminalFrame::from_bytes(br#"{"type":"close"}"#).unwrap(),
            TerminalFrame::Close { reason: None }
        );
        let json = serde_json::to_string(&TerminalFrame::Close { reason: None }).unwrap();
        assert_eq!(json, r#"{"type":"close"}"#);
    }

    #[test]
    fn test_unknown_tag_is_unrecognized() {
        let frame =
            TerminalFrame::from_bytes(br#"{"type":"set_mode","mode":"gui"}"#).unwrap();
        assert_eq!(frame, TerminalFrame::Unrecognized);
        assert_eq!(frame.kind(), "unrecognized");
    }

    #[test]
    fn test_raw_output_is_frame_error() {
        let raw = "Hello \x1b[32mgreen\x1b[0m";
        assert!(matches!(
            TerminalFrame::from_bytes(raw.as_bytes()),
            Err(SessionError::Frame(_))
        ));
    }
}
