//! Tool adapters.
//!
//! Each supported tool reports activity through its own hook payloads. An
//! adapter turns one native payload into zero or more [`HookEvent`]s. The
//! [`AdapterRegistry`] picks the adapter by [`ToolKind`].

mod adhoc;
mod claude;
mod codex;
mod gemini;

pub use adhoc::AdhocAdapter;
pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use gemini::GeminiAdapter;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::events::{EventType, HookEvent};
use crate::sessions::ToolKind;

#[derive(Debug, Error, PartialEq)]
pub enum AdapterError {
    #[error("no adapter registered for tool '{0}'")]
    NoAdapter(ToolKind),
    #[error("{tool} payload is missing '{field}'")]
    MissingField { tool: ToolKind, field: &'static str },
    #[error("{tool} event '{event}' is not supported")]
    UnsupportedEvent { tool: ToolKind, event: String },
    #[error("malformed {tool} payload: {reason}")]
    Malformed { tool: ToolKind, reason: String },
}

/// Normalizes one tool's native hook payloads.
pub trait ToolAdapter: Send + Sync {
    fn kind(&self) -> ToolKind;

    /// Event types this adapter can produce.
    fn supported_event_types(&self) -> &'static [EventType];

    /// Normalize a native payload. A payload may expand to several events
    /// (a patch touching many files) or none (events the bus ignores).
    fn normalize_event(&self, native: &Value) -> Result<Vec<HookEvent>, AdapterError>;
}

pub type BoxedAdapter = Box<dyn ToolAdapter>;

/// Adapters keyed by tool kind.
pub struct AdapterRegistry {
    adapters: HashMap<ToolKind, BoxedAdapter>,
}

impl AdapterRegistry {
    /// Registry with every built-in adapter.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(ClaudeAdapter));
        registry.register(Box::new(GeminiAdapter));
        registry.register(Box::new(CodexAdapter));
        registry.register(Box::new(AdhocAdapter));
        registry
    }

    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter, replacing any previous one for the same kind.
    pub fn register(&mut self, adapter: BoxedAdapter) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: ToolKind) -> Option<&dyn ToolAdapter> {
        self.adapters.get(&kind).map(|a| a.as_ref())
    }

    pub fn kinds(&self) -> Vec<ToolKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    /// Normalize with the adapter for `kind`.
    pub fn normalize(&self, kind: ToolKind, native: &Value) -> Result<Vec<HookEvent>, AdapterError> {
        let adapter = self.get(kind).ok_or(AdapterError::NoAdapter(kind))?;
        let events = adapter.normalize_event(native)?;
        tracing::debug!(tool = %kind, count = events.len(), "Normalized native hook payload");
        Ok(events)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Helpers shared by the adapters.

fn str_field<'v>(native: &'v Value, key: &str) -> Option<&'v str> {
    native.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Bus identity of the submitter: an explicit `bus_origin` wins over the
/// tool's own session field.
fn origin_of(tool: ToolKind, native: &Value, session_field: &'static str) -> Result<String, AdapterError> {
    str_field(native, "bus_origin")
        .or_else(|| str_field(native, session_field))
        .map(str::to_string)
        .ok_or(AdapterError::MissingField {
            tool,
            field: session_field,
        })
}

fn timestamp_of(native: &Value) -> Option<DateTime<Utc>> {
    str_field(native, "timestamp")
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

fn event(
    origin: &str,
    tool: ToolKind,
    event_type: EventType,
    payload: Value,
    native: &Value,
) -> HookEvent {
    let mut event = HookEvent::new(origin, tool, event_type, payload);
    event.client_timestamp = timestamp_of(native);
    event
}

/// Shell command as a single string; some tools send argv arrays.
fn command_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(parts) => {
            let parts: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
            (!parts.is_empty()).then(|| parts.join(" "))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_has_all_kinds() {
        let registry = AdapterRegistry::new();
        assert_eq!(registry.kinds().len(), ToolKind::ALL.len());
        for kind in ToolKind::ALL {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn test_missing_adapter() {
        let registry = AdapterRegistry::empty();
        assert_eq!(
            registry.normalize(ToolKind::Claude, &json!({})).unwrap_err(),
            AdapterError::NoAdapter(ToolKind::Claude)
        );
    }

    #[test]
    fn test_bus_origin_overrides_session_field() {
        let native = json!({"session_id": "uuid-1", "bus_origin": "alice"});
        assert_eq!(origin_of(ToolKind::Claude, &native, "session_id").unwrap(), "alice");
        let native = json!({"session_id": "uuid-1"});
        assert_eq!(origin_of(ToolKind::Claude, &native, "session_id").unwrap(), "uuid-1");
        assert!(origin_of(ToolKind::Claude, &json!({}), "session_id").is_err());
    }

    #[test]
    fn test_timestamp_parsing() {
        let native = json!({"timestamp": "2026-01-02T03:04:05Z"});
        assert_eq!(timestamp_of(&native).unwrap().to_rfc3339(), "2026-01-02T03:04:05+00:00");
        assert!(timestamp_of(&json!({"timestamp": "yesterday"})).is_none());
    }

    #[test]
    fn test_command_text() {
        assert_eq!(command_text(&json!("ls -la")).as_deref(), Some("ls -la"));
        assert_eq!(command_text(&json!(["git", "status"])).as_deref(), Some("git status"));
        assert_eq!(command_text(&json!([])), None);
    }
}
