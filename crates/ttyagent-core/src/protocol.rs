//! The JSON control-frame protocol spoken over the session WebSocket.
//!
//! Text frames carry internally-tagged JSON objects; raw binary frames
//! carry stdin (client to server) and merged stdout/stderr (server to
//! client) and never pass through this module.

use serde::{Deserialize, Serialize};

/// Why a text frame was rejected. A rejected frame produces exactly one
/// `error` reply and leaves the session state untouched.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed control frame: {0}")]
    Malformed(String),
    #[error("auth ticket must not be empty")]
    EmptyTicket,
    #[error("resize dimensions must be at least 1x1")]
    InvalidResize,
}

/// Frames a client may send. Any other `type` tag fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Auth { ticket: String },
    Stdin { data: String },
    Resize { cols: u32, rows: u32 },
    Ping,
}

/// Frames the server sends. `status` passes the upstream exec status
/// object through verbatim.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Ready,
    Authed,
    Started,
    Pong,
    Status { status: serde_json::Value },
    Error { message: String },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("server frames serialize to JSON")
    }
}

/// A TTY window size. Wire integers are validated to be at least 1 and
/// clamped into the `u16` range the exec channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub fn clamped(cols: u32, rows: u32) -> Self {
        Self {
            cols: cols.min(u16::MAX as u32) as u16,
            rows: rows.min(u16::MAX as u32) as u16,
        }
    }
}

/// Parses and canonicalizes one client text frame: the auth ticket is
/// trimmed and must be non-empty, resize dimensions must be positive.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, FrameError> {
    let mut frame: ClientFrame =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
    match &mut frame {
        ClientFrame::Auth { ticket } => {
            let trimmed = ticket.trim();
            if trimmed.is_empty() {
                return Err(FrameError::EmptyTicket);
            }
            *ticket = trimmed.to_string();
        }
        ClientFrame::Resize { cols, rows } => {
            if *cols == 0 || *rows == 0 {
                return Err(FrameError::InvalidResize);
            }
        }
        ClientFrame::Stdin { .. } | ClientFrame::Ping => {}
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_auth_and_trims_ticket() {
        let frame = parse_client_frame(r#"{"type":"auth","ticket":"  abc123  "}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Auth {
                ticket: "abc123".to_string()
            }
        );
    }

    #[test]
    fn empty_ticket_rejected() {
        assert!(matches!(
            parse_client_frame(r#"{"type":"auth","ticket":"   "}"#),
            Err(FrameError::EmptyTicket)
        ));
    }

    #[test]
    fn parses_stdin() {
        let frame = parse_client_frame(r#"{"type":"stdin","data":"ls -l\n"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Stdin {
                data: "ls -l\n".to_string()
            }
        );
    }

    #[test]
    fn parses_resize() {
        let frame = parse_client_frame(r#"{"type":"resize","cols":120,"rows":30}"#).unwrap();
        assert_eq!(frame, ClientFrame::Resize { cols: 120, rows: 30 });
    }

    #[test]
    fn zero_resize_rejected() {
        assert!(matches!(
            parse_client_frame(r#"{"type":"resize","cols":0,"rows":30}"#),
            Err(FrameError::InvalidResize)
        ));
        assert!(matches!(
            parse_client_frame(r#"{"type":"resize","cols":80,"rows":0}"#),
            Err(FrameError::InvalidResize)
        ));
    }

    #[test]
    fn negative_resize_is_malformed() {
        assert!(matches!(
            parse_client_frame(r#"{"type":"resize","cols":-1,"rows":30}"#),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn parses_ping() {
        assert_eq!(parse_client_frame(r#"{"type":"ping"}"#).unwrap(), ClientFrame::Ping);
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(matches!(
            parse_client_frame(r#"{"type":"subscribe"}"#),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn non_json_rejected() {
        assert!(matches!(
            parse_client_frame("not json"),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn encodes_lifecycle_frames() {
        assert_eq!(ServerFrame::Ready.encode(), r#"{"type":"ready"}"#);
        assert_eq!(ServerFrame::Authed.encode(), r#"{"type":"authed"}"#);
        assert_eq!(ServerFrame::Started.encode(), r#"{"type":"started"}"#);
        assert_eq!(ServerFrame::Pong.encode(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn encodes_error_frame() {
        let encoded = ServerFrame::error("Ticket expired.").encode();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "Ticket expired.");
    }

    #[test]
    fn status_passes_through_verbatim() {
        let status = serde_json::json!({"status": "Success", "metadata": {}});
        let encoded = ServerFrame::Status {
            status: status.clone(),
        }
        .encode();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["status"], status);
    }

    #[test]
    fn term_size_clamps_to_u16() {
        assert_eq!(
            TermSize::clamped(120, 30),
            TermSize { cols: 120, rows: 30 }
        );
        assert_eq!(
            TermSize::clamped(1_000_000, 2),
            TermSize {
                cols: u16::MAX,
                rows: 2
            }
        );
    }
}
