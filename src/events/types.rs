//! Event types stored in the log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sessions::ToolKind;

/// Origin used for events the daemon emits on its own behalf.
pub const SYSTEM_ORIGIN: &str = "_bus";

/// System origins start with an underscore and never become sessions.
pub fn is_system_origin(origin: &str) -> bool {
    origin.starts_with('_')
}

/// Kind of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Message,
    Status,
    FileEdit,
    Command,
    Lifecycle,
    Custom,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::Message,
        EventType::Status,
        EventType::FileEdit,
        EventType::Command,
        EventType::Lifecycle,
        EventType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Message => "message",
            EventType::Status => "status",
            EventType::FileEdit => "file-edit",
            EventType::Command => "command",
            EventType::Lifecycle => "lifecycle",
            EventType::Custom => "custom",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "message" => Ok(EventType::Message),
            "status" => Ok(EventType::Status),
            "file-edit" => Ok(EventType::FileEdit),
            "command" => Ok(EventType::Command),
            "lifecycle" | "life" => Ok(EventType::Lifecycle),
            "custom" => Ok(EventType::Custom),
            other => Err(format!("unknown event type: {}", other)),
        }
    }
}

/// Where a relayed event really came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayOrigin {
    /// Full device id of the remote daemon.
    pub device: String,
    /// Short device tag used to namespace remote session ids.
    pub short_id: String,
    /// Sequence number on the remote device.
    pub remote_seq: u64,
}

/// An appended, immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    /// Timestamp of record, assigned at append.
    pub timestamp: DateTime<Utc>,
    /// Timestamp reported by the submitter, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_timestamp: Option<DateTime<Utc>>,
    pub event_type: EventType,
    pub origin: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayOrigin>,
}

impl Event {
    /// When the event happened according to its submitter, falling back to
    /// the timestamp of record.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.client_timestamp.unwrap_or(self.timestamp)
    }

    pub fn is_relayed(&self) -> bool {
        self.relay.is_some()
    }

    pub fn is_system(&self) -> bool {
        is_system_origin(&self.origin)
    }

    /// Get a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Resolved targets of a message event.
    pub fn targets(&self) -> Vec<&str> {
        self.payload
            .get("targets")
            .and_then(Value::as_array)
            .map(|targets| targets.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// An event waiting to be appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub event_type: EventType,
    pub origin: String,
    pub payload: Value,
    #[serde(default)]
    pub thread: Option<String>,
    #[serde(default)]
    pub client_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub relay: Option<RelayOrigin>,
}

impl EventDraft {
    pub fn new(event_type: EventType, origin: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type,
            origin: origin.into(),
            payload,
            thread: None,
            client_timestamp: None,
            relay: None,
        }
    }

    pub fn with_thread(mut self, thread: Option<String>) -> Self {
        self.thread = thread;
        self
    }

    pub fn with_client_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.client_timestamp = Some(ts);
        self
    }

    pub fn with_relay(mut self, relay: RelayOrigin) -> Self {
        self.relay = Some(relay);
        self
    }
}

/// Normalized event submitted by a hook adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    /// Session identity of the submitter.
    pub origin: String,
    #[serde(default)]
    pub tool: ToolKind,
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

impl HookEvent {
    pub fn new(origin: impl Into<String>, tool: ToolKind, event_type: EventType, payload: Value) -> Self {
        Self {
            origin: origin.into(),
            tool,
            event_type,
            payload,
            client_timestamp: None,
            thread: None,
        }
    }

    /// Convert into a draft, stamping the tool kind into the payload so the
    /// session projection can pick it up.
    pub fn into_draft(self) -> EventDraft {
        let mut payload = match self.payload {
            Value::Object(map) => Value::Object(map),
            Value::Null => Value::Object(Default::default()),
            other => serde_json::json!({ "value": other }),
        };
        if let Some(map) = payload.as_object_mut() {
            map.entry("tool")
                .or_insert_with(|| Value::String(self.tool.to_string()));
        }
        EventDraft {
            event_type: self.event_type,
            origin: self.origin,
            payload,
            thread: self.thread,
            client_timestamp: self.client_timestamp,
            relay: None,
        }
    }
}
