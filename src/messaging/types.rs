//! Message types carried in `message` event payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the sender expects from the recipients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    /// Recipients are expected to answer.
    Request,
    #[default]
    Inform,
    /// Acknowledges an earlier message; needs `reply_to`.
    Ack,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Request => "request",
            Intent::Inform => "inform",
            Intent::Ack => "ack",
        }
    }
}

/// How targets were chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressingMode {
    Mentions,
    Broadcast,
    Thread,
}

impl AddressingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressingMode::Mentions => "mentions",
            AddressingMode::Broadcast => "broadcast",
            AddressingMode::Thread => "thread",
        }
    }
}

/// A message as submitted by a sender, before routing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub from: String,
    #[serde(default)]
    pub body: String,
    /// Explicit recipients, in addition to `@name` tokens in the body.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    /// Force an addressing mode instead of inferring it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<AddressingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    /// Sequence number of the message being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    /// Free-form structured data passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_timestamp: Option<DateTime<Utc>>,
}

impl OutgoingMessage {
    pub fn new(from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn mention(mut self, name: impl Into<String>) -> Self {
        self.mentions.push(name.into());
        self
    }

    pub fn broadcast(mut self) -> Self {
        self.mode = Some(AddressingMode::Broadcast);
        self
    }

    pub fn in_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    pub fn reply_to(mut self, seq: u64) -> Self {
        self.reply_to = Some(seq);
        self
    }

    pub fn intent(mut self, intent: Intent) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Payload of a routed `message` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub from: String,
    pub body: String,
    pub mode: AddressingMode,
    #[serde(default)]
    pub mentions: Vec<String>,
    /// Resolved at append time, sorted.
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub intent: Intent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
    /// Mentions that could not be resolved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl MessagePayload {
    /// Decode a stored message payload.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outgoing_defaults_from_json() {
        let msg: OutgoingMessage = serde_json::from_value(json!({"from": "a"})).unwrap();
        assert_eq!(msg.body, "");
        assert!(msg.mentions.is_empty());
        assert_eq!(msg.intent, None);
    }

    #[test]
    fn test_payload_decodes_minimal_shape() {
        let payload = MessagePayload::from_value(&json!({
            "from": "a",
            "body": "hi",
            "mode": "broadcast",
        }))
        .unwrap();
        assert_eq!(payload.intent, Intent::Inform);
        assert!(payload.targets.is_empty());
    }

    #[test]
    fn test_builder_chain() {
        let msg = OutgoingMessage::new("a", "hello")
            .mention("b")
            .in_thread("t")
            .reply_to(4)
            .intent(Intent::Request);
        assert_eq!(msg.mentions, vec!["b"]);
        assert_eq!(msg.thread.as_deref(), Some("t"));
        assert_eq!(msg.reply_to, Some(4));
        assert_eq!(msg.intent, Some(Intent::Request));
    }
}
