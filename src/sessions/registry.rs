//! Session registry.
//!
//! Reads come from the `sessions` table maintained by [`SessionProjection`];
//! every change is made by appending a lifecycle or status event, so the
//! table can always be rebuilt from the log.
//!
//! [`SessionProjection`]: super::SessionProjection

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use super::projection::action;
use super::types::{Session, SessionStatus, ToolKind};
use crate::db::SessionRepository;
use crate::error::{BusError, BusResult};
use crate::events::{is_system_origin, EventDraft, EventStore, EventType};

/// Optional metadata supplied at registration.
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    pub label: Option<String>,
    pub terminal: Option<String>,
}

pub struct SessionRegistry {
    store: Arc<EventStore>,
}

impl SessionRegistry {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }

    /// Register a session, or refresh its metadata if the id is already known.
    pub fn register(&self, id: &str, tool: ToolKind, meta: SessionMeta) -> BusResult<Session> {
        let id = validate_identity(id)?;

        let mut payload = Map::new();
        payload.insert("action".into(), json!(action::REGISTERED));
        payload.insert("tool".into(), json!(tool.as_str()));
        if let Some(label) = meta.label {
            payload.insert("label".into(), json!(label));
        }
        if let Some(terminal) = meta.terminal {
            payload.insert("terminal".into(), json!(terminal));
        }

        self.store
            .append(EventDraft::new(EventType::Lifecycle, id, Value::Object(payload)))?;
        self.require(id)
    }

    /// Record a status change for a known session.
    pub fn update_status(&self, id: &str, status: SessionStatus) -> BusResult<Session> {
        self.require(id)?;
        self.store.append(EventDraft::new(
            EventType::Status,
            id,
            json!({ "status": status.as_str() }),
        ))?;
        self.require(id)
    }

    pub fn get(&self, id: &str) -> BusResult<Option<Session>> {
        self.store.read(|conn| SessionRepository::new(conn).get(id))
    }

    pub fn list(&self, status: Option<SessionStatus>) -> BusResult<Vec<Session>> {
        self.store.read(|conn| SessionRepository::new(conn).list(status))
    }

    /// Sessions that currently receive broadcasts.
    pub fn reachable(&self) -> BusResult<Vec<Session>> {
        Ok(self
            .list(None)?
            .into_iter()
            .filter(|s| s.status.is_reachable())
            .collect())
    }

    /// Resolve a name, `@mention` or short prefix to exactly one session.
    ///
    /// An exact id wins outright. Otherwise case-insensitive id/label
    /// matches, the local part of `name:DEVICE` ids, and prefixes are
    /// considered; more than one candidate is an error rather than a guess.
    pub fn resolve(&self, name: &str) -> BusResult<Session> {
        let needle = name.trim().trim_start_matches('@');
        if needle.is_empty() {
            return Err(BusError::UnknownSession(name.to_string()));
        }

        let sessions = self.list(None)?;
        resolve_in(&sessions, needle)
            .cloned()
            .map_err(|candidates| match candidates.len() {
                0 => BusError::UnknownSession(needle.to_string()),
                _ => BusError::AmbiguousSession {
                    name: needle.to_string(),
                    candidates,
                },
            })
    }

    /// Mark a session idle on behalf of the daemon.
    pub fn mark_idle(&self, id: &str, reason: &str) -> BusResult<bool> {
        let Some(session) = self.get(id)? else {
            return Ok(false);
        };
        if matches!(session.status, SessionStatus::Idle | SessionStatus::Stopped) {
            return Ok(false);
        }
        self.store.append(EventDraft::new(
            EventType::Status,
            id,
            json!({ "status": SessionStatus::Idle.as_str(), "reason": reason }),
        ))?;
        tracing::debug!(session = %id, reason, "Session marked idle");
        Ok(true)
    }

    /// Stop a local session on someone else's behalf. Returns false when the
    /// session is unknown, remote, or already stopped.
    pub fn stop(&self, id: &str, by: &str) -> BusResult<bool> {
        let Some(session) = self.get(id)? else {
            return Ok(false);
        };
        if session.is_remote() || session.status == SessionStatus::Stopped {
            return Ok(false);
        }
        self.store.append(EventDraft::new(
            EventType::Lifecycle,
            id,
            json!({ "action": action::STOPPED, "by": by }),
        ))?;
        tracing::info!(session = %id, by, "Session stopped");
        Ok(true)
    }

    /// Drop a session from the registry. Its history stays in the log.
    pub fn archive(&self, id: &str) -> BusResult<()> {
        self.require(id)?;
        self.store.append(EventDraft::new(
            EventType::Lifecycle,
            id,
            json!({ "action": action::ARCHIVED }),
        ))?;
        Ok(())
    }

    /// Idle every reachable session last seen before `cutoff`, skipping ids in `busy`.
    pub fn sweep_idle(&self, cutoff: DateTime<Utc>, busy: &HashSet<String>) -> BusResult<Vec<String>> {
        let mut idled = Vec::new();
        for session in self.list(None)? {
            if session.is_remote() || busy.contains(&session.id) {
                continue;
            }
            if matches!(session.status, SessionStatus::Listening | SessionStatus::Active | SessionStatus::Starting)
                && session.last_seen < cutoff
                && self.mark_idle(&session.id, "inactive")?
            {
                idled.push(session.id);
            }
        }
        Ok(idled)
    }

    /// Archive every session last seen before `cutoff`.
    pub fn archive_stale(&self, cutoff: DateTime<Utc>) -> BusResult<Vec<String>> {
        let mut archived = Vec::new();
        for session in self.list(None)? {
            if session.last_seen < cutoff {
                self.archive(&session.id)?;
                archived.push(session.id);
            }
        }
        if !archived.is_empty() {
            tracing::info!(count = archived.len(), "Archived stale sessions");
        }
        Ok(archived)
    }

    /// Archive every session relayed from the device with full id `device`.
    pub fn archive_device(&self, device: &str) -> BusResult<Vec<String>> {
        let sessions = self
            .store
            .read(|conn| SessionRepository::new(conn).list_by_device(device))?;
        let mut archived = Vec::with_capacity(sessions.len());
        for session in sessions {
            self.archive(&session.id)?;
            archived.push(session.id);
        }
        Ok(archived)
    }

    fn require(&self, id: &str) -> BusResult<Session> {
        self.get(id)?
            .ok_or_else(|| BusError::UnknownSession(id.to_string()))
    }
}

pub(crate) fn validate_identity(id: &str) -> BusResult<&str> {
    let id = id.trim();
    if id.is_empty() {
        return Err(BusError::InvalidRequest("session id must not be empty".to_string()));
    }
    if is_system_origin(id) {
        return Err(BusError::InvalidRequest(format!(
            "session id '{}' is reserved",
            id
        )));
    }
    // ':' is reserved for sessions imported from other devices.
    if id.chars().any(|c| c.is_whitespace() || c == '@' || c == ':') {
        return Err(BusError::InvalidRequest(format!(
            "session id '{}' contains whitespace, '@' or ':'",
            id
        )));
    }
    Ok(id)
}

/// Resolution over a snapshot. `Err` carries the candidate ids (empty when none match).
fn resolve_in<'s>(sessions: &'s [Session], needle: &str) -> Result<&'s Session, Vec<String>> {
    if let Some(exact) = sessions.iter().find(|s| s.id == needle) {
        return Ok(exact);
    }

    let unique = |matches: Vec<&'s Session>| -> Option<Result<&'s Session, Vec<String>>> {
        match matches.len() {
            0 => None,
            1 => Some(Ok(matches[0])),
            _ => Some(Err(matches.iter().map(|s| s.id.clone()).collect())),
        }
    };

    let folded: Vec<&Session> = sessions
        .iter()
        .filter(|s| s.id.eq_ignore_ascii_case(needle) || s.label.eq_ignore_ascii_case(needle))
        .collect();
    if let Some(result) = unique(folded) {
        return result;
    }

    let local: Vec<&Session> = sessions
        .iter()
        .filter(|s| s.is_remote() && s.local_name().eq_ignore_ascii_case(needle))
        .collect();
    if let Some(result) = unique(local) {
        return result;
    }

    let lower = needle.to_lowercase();
    let prefixed: Vec<&Session> = sessions
        .iter()
        .filter(|s| s.id.to_lowercase().starts_with(&lower) || s.label.to_lowercase().starts_with(&lower))
        .collect();
    unique(prefixed).unwrap_or_else(|| Err(Vec::new()))
}
