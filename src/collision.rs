//! Concurrent-edit detection.
//!
//! Keeps, per file path, the latest edit of each session seen within the
//! window. A new edit collides with every other session's mark that is less
//! than one window away; each (mark, new edit) pair is compared exactly once,
//! so no pair of edits is reported twice. Marks more than a window older
//! than the newest edit are swept, and a path with no marks left is
//! forgotten, so memory follows recent activity rather than history.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::events::{AppendListener, Event, EventDraft, EventType, SYSTEM_ORIGIN};
use crate::messaging::{AddressingMode, Intent, MessagePayload};

/// Collision records kept in memory.
const MAX_RECORDS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionState {
    Notified,
    Acknowledged,
}

/// One side of a collision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRef {
    pub session: String,
    pub seq: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollisionRecord {
    pub id: u64,
    pub path: String,
    /// The earlier-observed edit.
    pub first: EditRef,
    /// The edit that triggered detection.
    pub second: EditRef,
    pub state: CollisionState,
}

impl CollisionRecord {
    pub fn sessions(&self) -> [&str; 2] {
        [&self.first.session, &self.second.session]
    }

    /// Message event telling both sessions about the collision.
    pub fn notification(&self, window: Duration) -> EventDraft {
        let mut targets = vec![self.first.session.clone(), self.second.session.clone()];
        targets.sort();
        let payload = MessagePayload {
            from: SYSTEM_ORIGIN.to_string(),
            body: format!(
                "Collision: {} and {} both edited {} within {}s",
                self.first.session,
                self.second.session,
                self.path,
                window.num_seconds()
            ),
            mode: AddressingMode::Mentions,
            mentions: vec![self.first.session.clone(), self.second.session.clone()],
            targets,
            intent: Intent::Inform,
            reply_to: None,
            warnings: Vec::new(),
            context: Some(json!({ "collision": self })),
        };
        let payload = serde_json::to_value(&payload).unwrap_or_else(|_| json!({}));
        EventDraft::new(EventType::Message, SYSTEM_ORIGIN, payload)
    }
}

#[derive(Debug, Clone)]
struct EditMark {
    session: String,
    seq: u64,
    at: DateTime<Utc>,
}

impl EditMark {
    fn to_ref(&self) -> EditRef {
        EditRef {
            session: self.session.clone(),
            seq: self.seq,
            at: self.at,
        }
    }
}

#[derive(Default)]
struct DetectorState {
    paths: HashMap<String, Vec<EditMark>>,
    records: Vec<CollisionRecord>,
    pending: Vec<CollisionRecord>,
    next_id: u64,
    /// Edit time of the last full sweep over `paths`.
    swept_at: Option<DateTime<Utc>>,
}

impl DetectorState {
    /// Drop marks older than `window` before `now`, and paths left empty.
    /// Runs at most once per window of edit time.
    fn sweep(&mut self, now: DateTime<Utc>, window: Duration) {
        if self.swept_at.is_some_and(|last| now - last < window) {
            return;
        }
        self.swept_at = Some(now);
        self.paths.retain(|_, marks| {
            marks.retain(|m| now - m.at < window);
            !marks.is_empty()
        });
    }
}

pub struct CollisionDetector {
    window: Duration,
    state: Mutex<DetectorState>,
}

impl CollisionDetector {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::seconds(20)),
            state: Mutex::new(DetectorState::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Feed one event; returns any collisions it caused.
    pub fn observe(&self, event: &Event) -> Vec<CollisionRecord> {
        let Some(path) = edit_path(event) else {
            return Vec::new();
        };
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };

        let at = event.occurred_at();
        let window = self.window;
        let mut found = Vec::new();

        state.sweep(at, window);
        let marks = state.paths.entry(path.clone()).or_default();
        marks.retain(|m| at - m.at < window);

        let new_mark = EditMark {
            session: event.origin.clone(),
            seq: event.seq,
            at,
        };
        for mark in marks.iter() {
            if mark.session != new_mark.session && (at - mark.at).abs() < window {
                found.push((mark.to_ref(), new_mark.to_ref()));
            }
        }
        marks.retain(|m| m.session != new_mark.session);
        marks.push(new_mark);

        let mut records = Vec::with_capacity(found.len());
        for (first, second) in found {
            state.next_id += 1;
            let record = CollisionRecord {
                id: state.next_id,
                path: path.clone(),
                first,
                second,
                state: CollisionState::Notified,
            };
            tracing::info!(
                path = %record.path,
                first = %record.first.session,
                second = %record.second.session,
                "Edit collision detected"
            );
            records.push(record);
        }

        state.records.extend(records.iter().cloned());
        if state.records.len() > MAX_RECORDS {
            let excess = state.records.len() - MAX_RECORDS;
            state.records.drain(..excess);
        }
        records
    }

    /// Rebuild state from stored history without producing notifications.
    pub fn prime<'e>(&self, events: impl IntoIterator<Item = &'e Event>) -> usize {
        events
            .into_iter()
            .map(|event| self.observe(event).len())
            .sum()
    }

    /// Collisions detected since the last call, in detection order.
    pub fn take_pending(&self) -> Vec<CollisionRecord> {
        self.state
            .lock()
            .map(|mut s| std::mem::take(&mut s.pending))
            .unwrap_or_default()
    }

    pub fn records(&self) -> Vec<CollisionRecord> {
        self.state
            .lock()
            .map(|s| s.records.clone())
            .unwrap_or_default()
    }

    /// Mark a collision acknowledged. Returns false for unknown ids.
    pub fn acknowledge(&self, id: u64) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        match state.records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.state = CollisionState::Acknowledged;
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.paths.clear();
            state.records.clear();
            state.pending.clear();
            state.swept_at = None;
        }
    }

    /// Number of paths currently tracked.
    pub fn tracked_paths(&self) -> usize {
        self.state.lock().map(|s| s.paths.len()).unwrap_or(0)
    }
}

impl AppendListener for CollisionDetector {
    fn on_append(&self, event: &Arc<Event>) {
        let records = self.observe(event);
        if records.is_empty() {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.pending.extend(records);
        }
    }

    fn on_reset(&self) {
        self.clear();
    }
}

/// Path of a local file-edit event by a real session.
fn edit_path(event: &Event) -> Option<String> {
    if event.event_type != EventType::FileEdit || event.is_system() || event.is_relayed() {
        return None;
    }
    event
        .payload_str("path")
        .or_else(|| event.payload_str("file"))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}
