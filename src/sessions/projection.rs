//! Derives session rows from the event log.

use rusqlite::Connection;
use serde_json::Value;

use super::types::{Session, SessionStatus, ToolKind};
use crate::db::SessionRepository;
use crate::events::{Event, EventType, Projection};

/// Lifecycle actions carried in `payload.action`.
pub mod action {
    pub const STARTED: &str = "started";
    pub const REGISTERED: &str = "registered";
    pub const READY: &str = "ready";
    pub const STOPPED: &str = "stopped";
    pub const ARCHIVED: &str = "archived";
}

/// Keeps the `sessions` table in step with the log.
pub struct SessionProjection;

impl Projection for SessionProjection {
    fn apply(&self, conn: &Connection, event: &Event) -> rusqlite::Result<()> {
        if event.is_system() || event.origin.is_empty() {
            return Ok(());
        }

        let repo = SessionRepository::new(conn);
        let existing = repo.get(&event.origin)?;

        match next_state(existing, event) {
            Transition::Upsert(session) => repo.upsert(&session),
            Transition::Delete => repo.delete(&event.origin).map(|_| ()),
            Transition::Skip => Ok(()),
        }
    }

    fn reset(&self, conn: &Connection) -> rusqlite::Result<()> {
        SessionRepository::new(conn).clear().map(|_| ())
    }
}

enum Transition {
    Upsert(Session),
    Delete,
    Skip,
}

fn next_state(existing: Option<Session>, event: &Event) -> Transition {
    let is_new = existing.is_none();
    let action = match event.event_type {
        EventType::Lifecycle => event.payload_str("action"),
        _ => None,
    };

    if action == Some(action::ARCHIVED) {
        return if is_new { Transition::Skip } else { Transition::Delete };
    }

    let mut session =
        existing.unwrap_or_else(|| Session::new(event.origin.clone(), ToolKind::default(), event.timestamp));

    apply_metadata(&mut session, &event.payload);
    if let Some(relay) = &event.relay {
        session.device = Some(relay.device.clone());
    }
    session.last_seen = event.timestamp;

    match event.event_type {
        EventType::Lifecycle => match action {
            Some(action::STARTED) => session.status = SessionStatus::Starting,
            Some(action::READY) => session.status = SessionStatus::Listening,
            Some(action::STOPPED) => session.status = SessionStatus::Stopped,
            // Re-registering keeps the current status.
            Some(action::REGISTERED) | Some(_) | None => {}
        },
        EventType::Status => {
            if let Some(status) = event
                .payload_str("status")
                .and_then(|s| s.parse::<SessionStatus>().ok())
            {
                session.status = status;
            }
        }
        EventType::Message | EventType::FileEdit | EventType::Command => {
            if session.status != SessionStatus::Stopped {
                session.status = SessionStatus::Active;
            }
        }
        EventType::Custom => {}
    }

    Transition::Upsert(session)
}

/// Copy tool/label/terminal/directory hints from a payload onto the session.
fn apply_metadata(session: &mut Session, payload: &Value) {
    if let Some(tool) = payload
        .get("tool")
        .and_then(Value::as_str)
        .and_then(|t| t.parse::<ToolKind>().ok())
    {
        session.tool = tool;
    }
    if let Some(label) = payload.get("label").and_then(Value::as_str) {
        if !label.trim().is_empty() {
            session.label = label.trim().to_string();
        }
    }
    if let Some(terminal) = payload.get("terminal").and_then(Value::as_str) {
        session.terminal = Some(terminal.to_string());
    }
    if let Some(dir) = payload
        .get("directory")
        .or_else(|| payload.get("cwd"))
        .and_then(Value::as_str)
        .filter(|d| !d.trim().is_empty())
    {
        session.directory = Some(dir.to_string());
    }
}
