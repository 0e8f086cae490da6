//! The append-only event store.
//!
//! All writers funnel through one SQLite connection guarded by a mutex; this
//! is where sequence numbers are assigned. Reads go through a second
//! connection so they see a committed snapshot without waiting on appends.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use super::filter::{CompiledFilter, EventFilter};
use super::types::{Event, EventDraft};
use crate::db::{Database, EventRepository, KvStore};
use crate::error::{BusError, BusResult};

/// Derived state maintained inside the append transaction.
///
/// A failing projection aborts the append, so derived rows can never
/// disagree with the log.
pub trait Projection: Send + Sync {
    fn apply(&self, conn: &Connection, event: &Event) -> rusqlite::Result<()>;

    /// Drop all derived state. Runs in the same transaction as the log reset.
    fn reset(&self, conn: &Connection) -> rusqlite::Result<()>;
}

/// Observer called after each commit, in sequence order.
pub trait AppendListener: Send + Sync {
    fn on_append(&self, event: &Arc<Event>);

    fn on_reset(&self) {}
}

/// Bookkeeping key holding the time of the last [`EventStore::reset`].
const RESET_AT_KEY: &str = "store.reset_at";

pub struct EventStore {
    writer: Mutex<Database>,
    reader: Mutex<Database>,
    projections: RwLock<Vec<Arc<dyn Projection>>>,
    listeners: RwLock<Vec<Arc<dyn AppendListener>>>,
    failure: Mutex<Option<String>>,
}

impl EventStore {
    /// Open (and migrate) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = Database::open_at(path.clone())?;
        writer.migrate()?;
        let reader = Database::open_at(path)?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            projections: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            failure: Mutex::new(None),
        })
    }

    pub fn add_projection(&self, projection: Arc<dyn Projection>) {
        if let Ok(mut projections) = self.projections.write() {
            projections.push(projection);
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn AppendListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    /// Append an event and return it with its sequence number and timestamp of record.
    pub fn append(&self, draft: EventDraft) -> BusResult<Arc<Event>> {
        self.append_with(draft, |_| Ok(()))
    }

    /// Append an event, running `extra` in the same transaction.
    ///
    /// Used to move bookkeeping (relay cursors) atomically with the event.
    pub fn append_with<F>(&self, draft: EventDraft, extra: F) -> BusResult<Arc<Event>>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<()>,
    {
        self.ensure_writable()?;
        let mut writer = self.lock_writer()?;

        let result = (|| -> rusqlite::Result<Event> {
            let tx = writer.conn_mut().transaction()?;
            let event = EventRepository::new(&tx).insert(&draft, Utc::now())?;
            for projection in self.projections_snapshot() {
                projection.apply(&tx, &event)?;
            }
            extra(&tx)?;
            tx.commit()?;
            Ok(event)
        })();

        let event = match result {
            Ok(event) => Arc::new(event),
            Err(e) => return Err(self.latch(e)),
        };

        tracing::debug!(seq = event.seq, event_type = %event.event_type, origin = %event.origin, "Appended event");

        // Still under the writer lock, so listeners observe append order.
        for listener in self.listeners_snapshot() {
            listener.on_append(&event);
        }
        drop(writer);

        Ok(event)
    }

    /// Events matching `filter`, ascending by sequence number.
    pub fn query(&self, filter: &EventFilter) -> BusResult<Vec<Event>> {
        let compiled = filter.compile()?;
        self.query_compiled(&compiled)
    }

    pub fn query_compiled(&self, compiled: &CompiledFilter) -> BusResult<Vec<Event>> {
        self.read(|conn| EventRepository::new(conn).query(compiled))
    }

    pub fn get(&self, seq: u64) -> BusResult<Option<Event>> {
        self.read(|conn| EventRepository::new(conn).get(seq))
    }

    /// Highest sequence number assigned so far.
    pub fn head(&self) -> BusResult<u64> {
        self.read(|conn| EventRepository::new(conn).head())
    }

    pub fn count(&self) -> BusResult<u64> {
        self.read(|conn| EventRepository::new(conn).count())
    }

    /// Clear the log and every projection in one transaction.
    ///
    /// Returns the number of events removed. Numbering continues from the
    /// previous head.
    pub fn reset(&self) -> BusResult<u64> {
        self.ensure_writable()?;
        let mut writer = self.lock_writer()?;

        let result = (|| -> rusqlite::Result<usize> {
            let tx = writer.conn_mut().transaction()?;
            let cleared = EventRepository::new(&tx).clear()?;
            for projection in self.projections_snapshot() {
                projection.reset(&tx)?;
            }
            KvStore::new(&tx).set(RESET_AT_KEY, &Utc::now().to_rfc3339())?;
            tx.commit()?;
            Ok(cleared)
        })();

        let cleared = result.map_err(|e| self.latch(e))?;
        tracing::info!(cleared, "Event store reset");

        for listener in self.listeners_snapshot() {
            listener.on_reset();
        }
        drop(writer);

        Ok(cleared as u64)
    }

    /// Run a read-only closure against the reader connection.
    pub fn read<T, F>(&self, f: F) -> BusResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let reader = self
            .reader
            .lock()
            .map_err(|_| BusError::StoreUnavailable("reader lock poisoned".to_string()))?;
        f(reader.conn()).map_err(|e| BusError::StoreUnavailable(e.to_string()))
    }

    pub fn kv_get(&self, key: &str) -> BusResult<Option<String>> {
        self.read(|conn| KvStore::new(conn).get(key))
    }

    pub fn kv_get_u64(&self, key: &str) -> BusResult<Option<u64>> {
        self.read(|conn| KvStore::new(conn).get_u64(key))
    }

    /// When the log was last reset; `None` if it never was.
    pub fn last_reset(&self) -> BusResult<Option<DateTime<Utc>>> {
        Ok(self
            .kv_get(RESET_AT_KEY)?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    /// Bookkeeping entries under `prefix`, ordered by key.
    pub fn kv_prefix(&self, prefix: &str) -> BusResult<Vec<(String, String)>> {
        self.read(|conn| KvStore::new(conn).list_prefix(prefix))
    }

    /// Write a bookkeeping value. Serialized with appends.
    pub fn kv_set(&self, key: &str, value: &str) -> BusResult<()> {
        self.ensure_writable()?;
        let writer = self.lock_writer()?;
        KvStore::new(writer.conn())
            .set(key, value)
            .map_err(|e| self.latch(e))
    }

    /// Whether the append path still accepts writes.
    pub fn is_writable(&self) -> bool {
        self.failure().is_none()
    }

    /// The error that latched the store read-only, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    pub fn path(&self) -> BusResult<std::path::PathBuf> {
        let reader = self
            .reader
            .lock()
            .map_err(|_| BusError::StoreUnavailable("reader lock poisoned".to_string()))?;
        Ok(reader.path().clone())
    }

    fn ensure_writable(&self) -> BusResult<()> {
        match self.failure() {
            Some(reason) => Err(BusError::StoreUnavailable(reason)),
            None => Ok(()),
        }
    }

    fn lock_writer(&self) -> BusResult<MutexGuard<'_, Database>> {
        self.writer
            .lock()
            .map_err(|_| BusError::StoreUnavailable("writer lock poisoned".to_string()))
    }

    /// Record a write failure; later writes are refused until restart.
    fn latch(&self, e: rusqlite::Error) -> BusError {
        let reason = e.to_string();
        tracing::error!(error = %reason, "Event store write failed, refusing further writes");
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert_with(|| reason.clone());
        }
        BusError::StoreUnavailable(reason)
    }

    fn projections_snapshot(&self) -> Vec<Arc<dyn Projection>> {
        self.projections
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn AppendListener>> {
        self.listeners.read().map(|l| l.clone()).unwrap_or_default()
    }
}
