//! SQLite database for the event log, session registry and relay cursors.

mod event_repository;
mod kv;
mod migrations;
mod schema;
mod session_repository;

use rusqlite::Connection;
use std::path::PathBuf;
use std::time::Duration;

pub use event_repository::EventRepository;
pub use kv::KvStore;
pub use schema::{datetime_to_micros, micros_to_datetime};
pub use session_repository::SessionRepository;

/// Database connection wrapper.
pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the database at `path`.
    pub fn open_at(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;

        // The log holds message bodies from every session.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!("Failed to set database file permissions: {}", e);
            }
        }

        // WAL lets the read connection see a snapshot while the writer appends.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;

        Ok(Self { conn, path })
    }

    /// Run database migrations.
    pub fn migrate(&self) -> anyhow::Result<()> {
        migrations::run_migrations(&self.conn)
    }

    /// Get a reference to the connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access, needed to open transactions.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Get the database path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}
