//! Claude Code hooks.
//!
//! Payloads carry `session_id` and `hook_event_name`; tool hooks add
//! `tool_name` and `tool_input`.

use serde_json::{json, Value};

use super::{command_text, event, origin_of, str_field, AdapterError, ToolAdapter};
use crate::events::{EventType, HookEvent};
use crate::sessions::{action, ToolKind};

const EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

pub struct ClaudeAdapter;

impl ToolAdapter for ClaudeAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::Claude
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

        let normalized = match hook {
            "SessionStart" => event(
                &origin,
                tool,
                EventType::Lifecycle,
                json!({
                    "action": action::STARTED,
                    "source": str_field(native, "source"),
                    "cwd": str_field(native, "cwd"),
                }),
                native,
            ),
            "SessionEnd" => event(
                &origin,
                tool,
                EventType::Lifecycle,
                json!({"action": action::STOPPED, "reason": str_field(native, "reason")}),
                native,
            ),
            "UserPromptSubmit" => event(
                &origin,
                tool,
                EventType::Status,
                json!({"status": "active", "detail": "prompt"}),
                native,
            ),
            "Stop" => event(
                &origin,
                tool,
                EventType::Status,
                json!({"status": "listening"}),
                native,
            ),
            "Notification" => event(
                &origin,
                tool,
                EventType::Custom,
                json!({"kind": "notification", "message": str_field(native, "message")}),
                native,
            ),
            "PreToolUse" => {
                let name = str_field(native, "tool_name").unwrap_or("unknown");
                event(
                    &origin,
                    tool,
                    EventType::Status,
                    json!({"status": "active", "detail": format!("tool:{}", name)}),
                    native,
                )
            }
            "PostToolUse" => return post_tool_use(&origin, native).map(|e| e.into_iter().collect()),
            other => {
                return Err(AdapterError::UnsupportedEvent {
                    tool,
                    event: other.to_string(),
                })
            }
        };
        Ok(vec![normalized])
    }
}

fn post_tool_use(origin: &str, native: &Value) -> Result<Option<HookEvent>, AdapterError> {
    let tool = ToolKind::Claude;
    let name = str_field(native, "tool_name").ok_or(AdapterError::MissingField {
        tool,
        field: "tool_name",
    })?;
    let input = native.get("tool_input").unwrap_or(&Value::Null);

    if EDIT_TOOLS.contains(&name) {
        let path = str_field(input, "file_path")
            .or_else(|| str_field(input, "notebook_path"))
            .ok_or(AdapterError::MissingField {
                tool,
                field: "tool_input.file_path",
            })?;
        return Ok(Some(event(
            origin,
            tool,
            EventType::FileEdit,
            json!({"path": path, "tool_name": name}),
            native,
        )));
    }

    if name == "Bash" {
        let command = input
            .get("command")
            .and_then(command_text)
            .ok_or(AdapterError::MissingField {
                tool,
                field: "tool_input.command",
            })?;
        return Ok(Some(event(
            origin,
            tool,
            EventType::Command,
            json!({"command": command, "tool_name": name}),
            native,
        )));
    }

    // Reads, searches and the like are not interesting to other agents.
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(native: Value) -> Result<Vec<HookEvent>, AdapterError> {
        ClaudeAdapter.normalize_event(&native)
    }

    #[test]
    fn test_session_lifecycle() {
        let events = normalize(json!({
            "session_id": "s1",
            "hook_event_name": "SessionStart",
            "source": "startup",
            "cwd": "/repo"
        }))
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Lifecycle);
        assert_eq!(events[0].payload["action"], "started");
        assert_eq!(events[0].origin, "s1");
        assert_eq!(events[0].tool, ToolKind::Claude);

        let events = normalize(json!({"session_id": "s1", "hook_event_name": "SessionEnd"})).unwrap();
        assert_eq!(events[0].payload["action"], "stopped");
    }

    #[test]
    fn test_edit_becomes_file_edit() {
        let events = normalize(json!({
            "session_id": "s1",
            "bus_origin": "alice",
            "hook_event_name": "PostToolUse",
            "tool_name": "Edit",
            "tool_input": {"file_path": "/repo/src/main.rs", "old_string": "a", "new_string": "b"}
        }))
        .unwrap();
        assert_eq!(events[0].event_type, EventType::FileEdit);
        assert_eq!(events[0].payload["path"], "/repo/src/main.rs");
        assert_eq!(events[0].origin, "alice");
    }

    #[test]
    fn test_bash_becomes_command() {
        let events = normalize(json!({
            "session_id": "s1",
            "hook_event_name": "PostToolUse",
            "tool_name": "Bash",
            "tool_input": {"command": "cargo fmt"}
        }))
        .unwrap();
        assert_eq!(events[0].event_type, EventType::Command);
        assert_eq!(events[0].payload["command"], "cargo fmt");
    }

    #[test]
    fn test_read_tools_are_ignored() {
        let events = normalize(json!({
            "session_id": "s1",
            "hook_event_name": "PostToolUse",
            "tool_name": "Read",
            "tool_input": {"file_path": "/repo/README.md"}
        }))
        .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_pre_tool_use_marks_active() {
        let events = normalize(json!({
            "session_id": "s1",
            "hook_event_name": "PreToolUse",
            "tool_name": "Write"
        }))
        .unwrap();
        assert_eq!(events[0].event_type, EventType::Status);
        assert_eq!(events[0].payload["detail"], "tool:Write");
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            normalize(json!({"hook_event_name": "Stop"})),
            Err(AdapterError::MissingField { field: "session_id", .. })
        ));
        assert!(matches!(
            normalize(json!({"session_id": "s1", "hook_event_name": "PreCompact"})),
            Err(AdapterError::UnsupportedEvent { .. })
        ));
        assert!(matches!(
            normalize(json!({"session_id": "s1", "hook_event_name": "PostToolUse", "tool_name": "Edit"})),
            Err(AdapterError::MissingField { .. })
        ));
    }
}
