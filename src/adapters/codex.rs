//! Codex notify payloads.
//!
//! Codex identifies the conversation with `thread-id` and tags payloads with
//! a kebab-case `type`. Patches may touch several files; each becomes its own
//! file-edit event.

use serde_json::{json, Value};

use super::{command_text, event, origin_of, str_field, AdapterError, ToolAdapter};
use crate::events::{EventType, HookEvent};
use crate::sessions::{action, ToolKind};

pub struct CodexAdapter;

impl ToolAdapter for CodexAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::Codex
    }

    fn supported_event_types(&self) -> &'static [EventType] {
        &[
            EventType::Lifecycle,
            EventType::Status,
            EventType::FileEdit,
            EventType::Command,
        ]
    }

    fn normalize_event(&self, native: &Value) -> Result<Vec<HookEvent>, AdapterError> {
        let tool = self.kind();
        let origin = origin_of(tool, native, "thread-id")?;
        let kind = str_field(native, "type").ok_or(AdapterError::MissingField { tool, field: "type" })?;
        let single = |event_type: EventType, payload: Value| -> Result<Vec<HookEvent>, AdapterError> {
            Ok(vec![event(&origin, tool, event_type, payload, native)])
        };

        match kind {
            "session-start" => single(
                EventType::Lifecycle,
                json!({"action": action::STARTED, "cwd": str_field(native, "cwd")}),
            ),
            "session-end" => single(EventType::Lifecycle, json!({"action": action::STOPPED})),
            "agent-turn-complete" => single(
                EventType::Status,
                json!({
                    "status": "listening",
                    "detail": str_field(native, "last-assistant-message"),
                }),
            ),
            "exec-command" => {
                let command = native.get("command").and_then(command_text).ok_or(
                    AdapterError::MissingField {
                        tool,
                        field: "command",
                    },
                )?;
                single(EventType::Command, json!({"command": command}))
            }
            "apply-patch" => {
                let paths = patch_paths(native);
                if paths.is_empty() {
                    return Err(AdapterError::Malformed {
                        tool,
                        reason: "apply-patch without changed paths".to_string(),
                    });
                }
                Ok(paths
                    .into_iter()
                    .map(|path| event(&origin, tool, EventType::FileEdit, json!({"path": path}), native))
                    .collect())
            }
            other => Err(AdapterError::UnsupportedEvent {
                tool,
                event: other.to_string(),
            }),
        }
    }
}

/// `changes` is either an object keyed by path or a list of paths.
fn patch_paths(native: &Value) -> Vec<String> {
    let mut paths: Vec<String> = match native.get("changes") {
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().or_else(|| v.get("path").and_then(Value::as_str)))
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    if let Some(path) = str_field(native, "path") {
        paths.push(path.to_string());
    }
    paths.sort();
    paths.dedup();
    paths
}
