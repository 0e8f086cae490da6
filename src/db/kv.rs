//! Small key/value table for daemon bookkeeping (relay cursors, device id).

use rusqlite::{Connection, OptionalExtension};

pub struct KvStore<'a> {
    conn: &'a Connection,
}

impl<'a> KvStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, key: &str) -> rusqlite::Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM kv WHERE key = ?", [key], |row| row.get(0))
            .optional()
    }

    /// Get a value parsed as an unsigned integer; unparsable values read as absent.
    pub fn get_u64(&self, key: &str) -> rusqlite::Result<Option<u64>> {
        Ok(self.get(key)?.and_then(|v| v.parse().ok()))
    }

    pub fn set(&self, key: &str, value: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?, ?, unixepoch())
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            [key, value],
        )?;
        Ok(())
    }

    /// All entries whose key starts with `prefix`, ordered by key.
    pub fn list_prefix(&self, prefix: &str) -> rusqlite::Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")?;
        let rows = stmt.query_map([prefix], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }
}
