//! SQLite-backed event log.
//!
//! Rows are only ever inserted, or removed all at once by [`EventRepository::clear`].
//! `seq` is an AUTOINCREMENT key so numbering continues after a clear.

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};

use super::schema::{datetime_to_micros, json_column, micros_to_datetime, parse_column};
use crate::events::{CompiledFilter, Event, EventDraft, EventType, RelayOrigin};

const EVENT_COLUMNS: &str = "seq, ts_micros, client_ts_micros, event_type, origin, payload, \
                             thread, relay_device, relay_short, relay_seq";

/// Event log operations over a connection or an open transaction.
pub struct EventRepository<'a> {
    conn: &'a Connection,
}

impl<'a> EventRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a draft and return the stored event with its assigned sequence number.
    pub fn insert(&self, draft: &EventDraft, timestamp: DateTime<Utc>) -> rusqlite::Result<Event> {
        let payload = serde_json::to_string(&draft.payload)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        self.conn.execute(
            "INSERT INTO events (ts_micros, client_ts_micros, event_type, origin, payload,
                                 thread, relay_device, relay_short, relay_seq)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                datetime_to_micros(timestamp),
                draft.client_timestamp.map(datetime_to_micros),
                draft.event_type.as_str(),
                draft.origin,
                payload,
                draft.thread,
                draft.relay.as_ref().map(|r| r.device.as_str()),
                draft.relay.as_ref().map(|r| r.short_id.as_str()),
                draft.relay.as_ref().map(|r| r.remote_seq as i64),
            ],
        )?;

        Ok(Event {
            seq: self.conn.last_insert_rowid() as u64,
            timestamp,
            client_timestamp: draft.client_timestamp,
            event_type: draft.event_type,
            origin: draft.origin.clone(),
            payload: draft.payload.clone(),
            thread: draft.thread.clone(),
            relay: draft.relay.clone(),
        })
    }

    /// Fetch a single event by sequence number.
    pub fn get(&self, seq: u64) -> rusqlite::Result<Option<Event>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM events WHERE seq = ?", EVENT_COLUMNS),
                [seq as i64],
                row_to_event,
            )
            .optional()
    }

    /// Events matching a filter, ascending by sequence number.
    ///
    /// Column criteria are pushed into SQL; the payload predicate and
    /// session targeting are evaluated on the decoded rows.
    pub fn query(&self, compiled: &CompiledFilter) -> rusqlite::Result<Vec<Event>> {
        let filter = compiled.filter();
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        if let Some(after) = filter.after_seq {
            clauses.push("seq > ?".to_string());
            params.push(SqlValue::Integer(after as i64));
        }
        if let Some(until) = filter.until_seq {
            clauses.push("seq <= ?".to_string());
            params.push(SqlValue::Integer(until as i64));
        }
        if !filter.types.is_empty() {
            clauses.push(format!("event_type IN ({})", placeholders(filter.types.len())));
            params.extend(
                filter
                    .types
                    .iter()
                    .map(|t| SqlValue::Text(t.as_str().to_string())),
            );
        }
        if !filter.origins.is_empty() {
            clauses.push(format!("origin IN ({})", placeholders(filter.origins.len())));
            params.extend(filter.origins.iter().cloned().map(SqlValue::Text));
        }
        if let Some(thread) = &filter.thread {
            clauses.push("thread = ?".to_string());
            params.push(SqlValue::Text(thread.clone()));
        }
        if let Some(since) = filter.since {
            clauses.push("ts_micros >= ?".to_string());
            params.push(SqlValue::Integer(datetime_to_micros(since)));
        }
        if let Some(until) = filter.until {
            clauses.push("ts_micros <= ?".to_string());
            params.push(SqlValue::Integer(datetime_to_micros(until)));
        }
        if filter.local_only {
            clauses.push("relay_device IS NULL".to_string());
        }
        if filter.exclude_system {
            clauses.push("origin NOT LIKE '\\_%' ESCAPE '\\'".to_string());
        }

        let mut sql = format!("SELECT {} FROM events", EVENT_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY seq");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), row_to_event)?;

        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut events = Vec::new();
        for row in rows {
            let event = row?;
            if compiled.matches(&event) {
                events.push(event);
                if events.len() >= limit {
                    break;
                }
            }
        }
        Ok(events)
    }

    /// Highest sequence number ever assigned, 0 for a fresh log.
    pub fn head(&self) -> rusqlite::Result<u64> {
        let seq: Option<i64> = self
            .conn
            .query_row(
                "SELECT seq FROM sqlite_sequence WHERE name = 'events'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0).max(0) as u64)
    }

    /// Number of stored events.
    pub fn count(&self) -> rusqlite::Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Remove every event. Sequence numbering is not reset.
    pub fn clear(&self) -> rusqlite::Result<usize> {
        self.conn.execute("DELETE FROM events", [])
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let event_type: String = row.get(3)?;
    let payload: String = row.get(5)?;
    let relay_device: Option<String> = row.get(7)?;
    let relay_short: Option<String> = row.get(8)?;
    let relay_seq: Option<i64> = row.get(9)?;

    let relay = match (relay_device, relay_short) {
        (Some(device), Some(short_id)) => Some(RelayOrigin {
            device,
            short_id,
            remote_seq: relay_seq.unwrap_or(0).max(0) as u64,
        }),
        _ => None,
    };

    Ok(Event {
        seq: row.get::<_, i64>(0)? as u64,
        timestamp: micros_to_datetime(row.get(1)?),
        client_timestamp: row.get::<_, Option<i64>>(2)?.map(micros_to_datetime),
        event_type: parse_column::<EventType>(3, &event_type)?,
        origin: row.get(4)?,
        payload: json_column(5, &payload)?,
        thread: row.get(6)?,
        relay,
    })
}
