//! Relay wire format.
//!
//! Each device publishes retained frames on `{namespace}/{device}` and
//! subscribes to `{namespace}/+`. A frame carries a batch of that device's
//! local events in sequence order; the sequence number doubles as the
//! per-direction resume cursor. An empty payload on a device topic means
//! the device has gone away. Frames also carry a snapshot of the device's
//! local sessions.
//!
//! `{namespace}/control` carries non-retained [`ControlFrame`]s asking one
//! device to act on one of its sessions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{Event, EventType};
use crate::sessions::{Session, SessionStatus, ToolKind};

const CONTROL_LEVEL: &str = "control";

/// One event as sent over the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Sequence number on the publishing device.
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub event_type: EventType,
    pub origin: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

impl From<&Event> for WireEvent {
    fn from(event: &Event) -> Self {
        Self {
            seq: event.seq,
            ts: event.occurred_at(),
            event_type: event.event_type,
            origin: event.origin.clone(),
            payload: event.payload.clone(),
            thread: event.thread.clone(),
        }
    }
}

/// One local session as advertised to other devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Id on the publishing device, without any device suffix.
    pub id: String,
    pub tool: ToolKind,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl From<&Session> for SessionState {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            tool: session.tool,
            status: session.status,
            label: Some(session.label.clone()).filter(|l| *l != session.id),
            directory: session.directory.clone(),
            last_seen: session.last_seen,
        }
    }
}

/// Snapshot of a device's registry at publish time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub sessions: Vec<SessionState>,
    /// Last time the device reset its log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub device: String,
    pub short_id: String,
    pub events: Vec<WireEvent>,
    /// More events were pending when this frame was built.
    #[serde(default)]
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DeviceState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Stop,
    Start,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Stop => "stop",
            ControlAction::Start => "start",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stop" => Ok(ControlAction::Stop),
            "start" => Ok(ControlAction::Start),
            other => Err(format!("unknown control action: {}", other)),
        }
    }
}

/// A request for one device to act on one of its own sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFrame {
    pub from_device: String,
    pub from_short: String,
    /// Send time; receivers ignore frames not newer than the last one seen
    /// from the same device.
    pub ts: DateTime<Utc>,
    pub action: ControlAction,
    /// Session id as known on the target device.
    pub target: String,
    /// Short id of the device that owns `target`.
    pub target_device: String,
}

pub fn device_topic(namespace: &str, device: &str) -> String {
    format!("{}/{}", namespace, device)
}

pub fn wildcard_topic(namespace: &str) -> String {
    format!("{}/+", namespace)
}

pub fn control_topic(namespace: &str) -> String {
    format!("{}/{}", namespace, CONTROL_LEVEL)
}

/// Device id from a device topic in `namespace`.
pub fn device_from_topic<'t>(namespace: &str, topic: &'t str) -> Option<&'t str> {
    let rest = topic.strip_prefix(namespace)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') || rest == CONTROL_LEVEL {
        None
    } else {
        Some(rest)
    }
}

/// Four-character tag used to namespace a device's session ids.
pub fn short_id(device: &str) -> String {
    device
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(4)
        .collect::<String>()
        .to_uppercase()
}
