//! Ad-hoc senders (scripts, humans) that already speak the bus vocabulary.

use serde::Deserialize;
use serde_json::Value;

use super::{AdapterError, ToolAdapter};
use crate::events::{EventType, HookEvent};
use crate::sessions::ToolKind;

pub struct AdhocAdapter;

#[derive(Deserialize)]
struct AdhocPayload {
    #[serde(alias = "from", alias = "name")]
    origin: String,
    #[serde(alias = "type")]
    event_type: EventType,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    thread: Option<String>,
    #[serde(default, alias = "timestamp")]
    client_timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl ToolAdapter for AdhocAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::Adhoc
    }

    fn supported_event_types(&self) -> &'static [EventType] {
        &EventType::ALL
    }

    fn normalize_event(&self, native: &Value) -> Result<Vec<HookEvent>, AdapterError> {
        let parsed = AdhocPayload::deserialize(native).map_err(|e| AdapterError::Malformed {
            tool: ToolKind::Adhoc,
            reason: e.to_string(),
        })?;
        let mut event = HookEvent::new(parsed.origin, ToolKind::Adhoc, parsed.event_type, parsed.payload);
        event.thread = parsed.thread;
        event.client_timestamp = parsed.client_timestamp;
        Ok(vec![event])
    }
}
