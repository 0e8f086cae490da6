//! Structured event filters shared by queries and live subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::predicate::{FilterError, Predicate};
use super::types::{Event, EventType};

/// Filter over the event log.
///
/// Every field is optional; an empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Only events with a sequence number strictly greater than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_seq: Option<u64>,
    /// Only events with a sequence number less than or equal to this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<EventType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub origins: Vec<String>,
    /// Events from this session or messages addressed to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    /// Predicate expression over payload fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    /// Exclude events re-injected by the relay.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local_only: bool,
    /// Exclude events from system origins.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exclude_system: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn after(mut self, seq: u64) -> Self {
        self.after_seq = Some(seq);
        self
    }

    pub fn until(mut self, seq: u64) -> Self {
        self.until_seq = Some(seq);
        self
    }

    pub fn types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.types = types.into_iter().collect();
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origins.push(origin.into());
        self
    }

    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    pub fn predicate(mut self, expr: impl Into<String>) -> Self {
        self.predicate = Some(expr.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Parse the predicate and produce a matcher.
    pub fn compile(&self) -> Result<CompiledFilter, FilterError> {
        let predicate = self.predicate.as_deref().map(Predicate::parse).transpose()?;
        Ok(CompiledFilter {
            filter: self.clone(),
            predicate,
        })
    }
}

/// A filter with its predicate parsed.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    filter: EventFilter,
    predicate: Option<Predicate>,
}

impl CompiledFilter {
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Check whether an event passes every criterion.
    pub fn matches(&self, event: &Event) -> bool {
        let f = &self.filter;

        if f.after_seq.is_some_and(|after| event.seq <= after) {
            return false;
        }
        if f.until_seq.is_some_and(|until| event.seq > until) {
            return false;
        }
        if !f.types.is_empty() && !f.types.contains(&event.event_type) {
            return false;
        }
        if !f.origins.is_empty() && !f.origins.iter().any(|o| o == &event.origin) {
            return false;
        }
        if let Some(session) = &f.session {
            if &event.origin != session && !event.targets().contains(&session.as_str()) {
                return false;
            }
        }
        if let Some(thread) = &f.thread {
            if event.thread.as_ref() != Some(thread) {
                return false;
            }
        }
        if f.since.is_some_and(|since| event.timestamp < since) {
            return false;
        }
        if f.until.is_some_and(|until| event.timestamp > until) {
            return false;
        }
        if f.local_only && event.is_relayed() {
            return false;
        }
        if f.exclude_system && event.is_system() {
            return false;
        }
        self.predicate
            .as_ref()
            .map_or(true, |p| p.eval(&event.payload))
    }
}
