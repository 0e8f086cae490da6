//! Gemini CLI hooks.

use serde_json::{json, Value};

use super::{command_text, event, origin_of, str_field, AdapterError, ToolAdapter};
use crate::events::{EventType, HookEvent};
use crate::sessions::{action, ToolKind};

const EDIT_TOOLS: &[&str] = &["write_file", "replace", "edit"];
const SHELL_TOOLS: &[&str] = &["run_shell_command", "shell"];

pub struct GeminiAdapter;

impl ToolAdapter for GeminiAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::Gemini
    }

    fn supported_event_types(&self) -> &'static [EventType] {
        &[
            EventType::Lifecycle,
            EventType::Status,
            EventType::FileEdit,
            EventType::Command,
            EventType::Custom,
        ]
    }

    fn normalize_event(&self, native: &Value) -> Result<Vec<HookEvent>, AdapterError> {
        let tool = self.kind();
        let origin = origin_of(tool, native, "session_id")?;
        let hook = str_field(native, "hook_event_name").ok_or(AdapterError::MissingField {
            tool,
            field: "hook_event_name",
        })?;

        let (event_type, payload) = match hook {
            "SessionStart" => (
                EventType::Lifecycle,
                json!({"action": action::STARTED, "source": str_field(native, "source")}),
            ),
            "SessionEnd" => (
                EventType::Lifecycle,
                json!({"action": action::STOPPED, "reason": str_field(native, "reason")}),
            ),
            "BeforeAgent" => (EventType::Status, json!({"status": "active", "detail": "prompt"})),
            "AfterAgent" => (EventType::Status, json!({"status": "listening"})),
            "Notification" => (
                EventType::Custom,
                json!({"kind": "notification", "message": str_field(native, "message")}),
            ),
            "BeforeTool" => {
                let name = str_field(native, "tool_name").unwrap_or("unknown");
                (
                    EventType::Status,
                    json!({"status": "active", "detail": format!("tool:{}", name)}),
                )
            }
            "AfterTool" => {
                let name = str_field(native, "tool_name").ok_or(AdapterError::MissingField {
                    tool,
                    field: "tool_name",
                })?;
                let input = native.get("tool_input").unwrap_or(&Value::Null);
                if EDIT_TOOLS.contains(&name) {
                    let path = str_field(input, "file_path")
                        .or_else(|| str_field(input, "absolute_path"))
                        .ok_or(AdapterError::MissingField {
                            tool,
                            field: "tool_input.file_path",
                        })?;
                    (EventType::FileEdit, json!({"path": path, "tool_name": name}))
                } else if SHELL_TOOLS.contains(&name) {
                    let command = input.get("command").and_then(command_text).ok_or(
                        AdapterError::MissingField {
                            tool,
                            field: "tool_input.command",
                        },
                    )?;
                    (EventType::Command, json!({"command": command, "tool_name": name}))
                } else {
                    return Ok(Vec::new());
                }
            }
            other => {
                return Err(AdapterError::UnsupportedEvent {
                    tool,
                    event: other.to_string(),
                })
            }
        };

        Ok(vec![event(&origin, tool, event_type, payload, native)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_after_tool_edit() {
        let events = GeminiAdapter
            .normalize_event(&json!({
                "session_id": "g1",
                "hook_event_name": "AfterTool",
                "tool_name": "replace",
                "tool_input": {"file_path": "/repo/lib.rs"},
                "timestamp": "2026-03-01T10:00:00Z"
            }))
            .unwrap();
        assert_eq!(events[0].event_type, EventType::FileEdit);
        assert_eq!(events[0].payload["path"], "/repo/lib.rs");
        assert_eq!(events[0].tool, ToolKind::Gemini);
        assert!(events[0].client_timestamp.is_some());
    }

    #[test]
    fn test_shell_and_lifecycle() {
        let events = GeminiAdapter
            .normalize_event(&json!({
                "session_id": "g1",
                "hook_event_name": "AfterTool",
                "tool_name": "run_shell_command",
                "tool_input": {"command": "npm test"}
            }))
            .unwrap();
        assert_eq!(events[0].payload["command"], "npm test");

        let events = GeminiAdapter
            .normalize_event(&json!({"session_id": "g1", "hook_event_name": "AfterAgent"}))
            .unwrap();
        assert_eq!(events[0].payload["status"], "listening");
    }

    #[test]
    fn test_other_tools_ignored() {
        let events = GeminiAdapter
            .normalize_event(&json!({
                "session_id": "g1",
                "hook_event_name": "AfterTool",
                "tool_name": "read_file"
            }))
            .unwrap();
        assert!(events.is_empty());
    }
}
