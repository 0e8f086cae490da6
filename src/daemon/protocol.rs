//! Local socket protocol.
//!
//! Newline-delimited JSON. Every line is one object tagged by `type`.
//!
//! ### Requests
//! ```json
//! {"type": "register", "id": "alice", "tool": "claude", "terminal": "tmux:%3"}
//! {"type": "ingest", "event": {"origin": "alice", "event_type": "file-edit", "payload": {"path": "src/lib.rs"}}}
//! {"type": "ingest_native", "tool": "claude", "payload": {...}}
//! {"type": "send", "message": {"from": "alice", "body": "@bob ready?"}}
//! {"type": "subscribe", "filter": {"types": ["message"]}, "from": 120}
//! {"type": "relay_control", "action": "stop", "session": "reviewer:7F3A"}
//! ```
//!
//! ### Responses
//! ```json
//! {"type": "appended", "events": [...]}
//! {"type": "event", "subscription": 3, "event": {...}}
//! {"type": "gap", "subscription": 3, "missed": 12, "resume_after": 467}
//! {"type": "error", "kind": "unknown_session", "message": "..."}
//! ```
//!
//! Requests on one connection are answered in order. Subscription items are
//! interleaved with responses as they arrive.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::bus::BusHealth;
use crate::collision::CollisionRecord;
use crate::error::BusError;
use crate::events::{Event, EventFilter, HookEvent};
use crate::messaging::OutgoingMessage;
use crate::relay::{ControlAction, ControlFrame};
use crate::sessions::{Session, SessionStatus, ToolKind};

/// Longest accepted request line.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Request line too long")]
    LineTooLong,
    #[error("Connection closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Ping,
    /// Register a session and bind it to this connection.
    Register {
        id: String,
        #[serde(default)]
        tool: ToolKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        terminal: Option<String>,
    },
    SetStatus {
        id: String,
        status: SessionStatus,
    },
    Ingest {
        event: HookEvent,
    },
    IngestNative {
        tool: ToolKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
        payload: Value,
    },
    Send {
        message: OutgoingMessage,
    },
    Query {
        #[serde(default)]
        filter: EventFilter,
    },
    ListSessions {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<SessionStatus>,
    },
    Resolve {
        name: String,
    },
    Subscribe {
        #[serde(default)]
        filter: EventFilter,
        /// Replay stored events after this sequence number first.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<u64>,
    },
    Unsubscribe {
        id: u64,
    },
    Reset,
    Health,
    Collisions,
    AckCollision {
        id: u64,
    },
    /// Stop or start a session owned by another device.
    RelayControl {
        action: ControlAction,
        session: String,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong {
        version: String,
    },
    Session {
        session: Session,
    },
    Appended {
        events: Vec<Event>,
    },
    Events {
        events: Vec<Event>,
    },
    Sessions {
        sessions: Vec<Session>,
    },
    Subscribed {
        id: u64,
    },
    Event {
        subscription: u64,
        event: Event,
    },
    Gap {
        subscription: u64,
        missed: u64,
        resume_after: u64,
    },
    Unsubscribed {
        id: u64,
        existed: bool,
    },
    ResetDone {
        removed: u64,
    },
    Health {
        health: Box<BusHealth>,
    },
    Collisions {
        collisions: Vec<CollisionRecord>,
    },
    Acknowledged {
        id: u64,
    },
    ControlSent {
        control: ControlFrame,
    },
    ShuttingDown,
    Error {
        kind: String,
        message: String,
    },
}

impl Response {
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<BusError> for Response {
    fn from(err: BusError) -> Self {
        Response::error(err.kind(), err.to_string())
    }
}

pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(ProtocolError::LineTooLong);
    }
    Ok(serde_json::from_str(line.trim())?)
}

/// Serialize one frame, newline included.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;

    #[test]
    fn test_parse_requests() {
        assert_eq!(parse_request(r#"{"type":"ping"}"#).unwrap(), Request::Ping);

        let req = parse_request(
            r#"{"type":"subscribe","filter":{"types":["message","file-edit"]},"from":7}"#,
        )
        .unwrap();
        match req {
            Request::Subscribe { filter, from } => {
                assert_eq!(filter.types, vec![EventType::Message, EventType::FileEdit]);
                assert_eq!(from, Some(7));
            }
            other => panic!("unexpected {:?}", other),
        }

        let req = parse_request(r#"{"type":"register","id":"alice"}"#).unwrap();
        assert!(matches!(req, Request::Register { tool: ToolKind::Adhoc, .. }));
    }

    #[test]
    fn test_parse_send() {
        let req = parse_request(
            r#"{"type":"send","message":{"from":"alice","body":"hi @bob","intent":"request"}}"#,
        )
        .unwrap();
        let Request::Send { message } = req else {
            panic!("expected send");
        };
        assert_eq!(message.from, "alice");
        assert_eq!(message.intent, Some(crate::messaging::Intent::Request));
    }

    #[test]
    fn test_parse_relay_control() {
        let req = parse_request(r#"{"type":"relay_control","action":"stop","session":"reviewer:7F3A"}"#).unwrap();
        assert_eq!(
            req,
            Request::RelayControl {
                action: ControlAction::Stop,
                session: "reviewer:7F3A".into()
            }
        );
        assert!(parse_request(r#"{"type":"relay_control","action":"reboot","session":"x:1"}"#).is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_request("{"), Err(ProtocolError::Json(_))));
        assert!(matches!(
            parse_request(r#"{"type":"teleport"}"#),
            Err(ProtocolError::Json(_))
        ));
        let huge = "x".repeat(MAX_LINE_BYTES + 1);
        assert!(matches!(parse_request(&huge), Err(ProtocolError::LineTooLong)));
    }

    #[test]
    fn test_encode_error_response() {
        let line = encode(&Response::from(BusError::UnknownSession("zed".into()))).unwrap();
        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["kind"], "unknown_session");
    }
}
