//! SQLite-backed session table.
//!
//! Rows are written only by the session projection, inside the same
//! transaction as the event that caused the change.

use rusqlite::{Connection, OptionalExtension, Row};

use super::schema::{datetime_to_micros, micros_to_datetime, parse_column};
use crate::sessions::{Session, SessionStatus, ToolKind};

const SESSION_COLUMNS: &str =
    "id, tool, label, status, last_seen_micros, created_micros, terminal, device, directory";

/// Session persistence operations.
pub struct SessionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SessionRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert or replace a session row.
    pub fn upsert(&self, session: &Session) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (id, tool, label, status, last_seen_micros, created_micros, terminal, device, directory)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                tool = excluded.tool,
                label = excluded.label,
                status = excluded.status,
                last_seen_micros = excluded.last_seen_micros,
                terminal = excluded.terminal,
                device = excluded.device,
                directory = excluded.directory",
            rusqlite::params![
                session.id,
                session.tool.as_str(),
                session.label,
                session.status.as_str(),
                datetime_to_micros(session.last_seen),
                datetime_to_micros(session.created_at),
                session.terminal,
                session.device,
                session.directory,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> rusqlite::Result<Option<Session>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS),
                [id],
                row_to_session,
            )
            .optional()
    }

    /// All sessions, optionally restricted to one status, ordered by id.
    pub fn list(&self, status: Option<SessionStatus>) -> rusqlite::Result<Vec<Session>> {
        match status {
            Some(status) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM sessions WHERE status = ? ORDER BY id",
                    SESSION_COLUMNS
                ))?;
                let rows = stmt.query_map([status.as_str()], row_to_session)?;
                rows.collect()
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM sessions ORDER BY id",
                    SESSION_COLUMNS
                ))?;
                let rows = stmt.query_map([], row_to_session)?;
                rows.collect()
            }
        }
    }

    /// Sessions relayed from a given remote device.
    pub fn list_by_device(&self, device: &str) -> rusqlite::Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sessions WHERE device = ? ORDER BY id",
            SESSION_COLUMNS
        ))?;
        let rows = stmt.query_map([device], row_to_session)?;
        rows.collect()
    }

    pub fn delete(&self, id: &str) -> rusqlite::Result<bool> {
        let deleted = self.conn.execute("DELETE FROM sessions WHERE id = ?", [id])?;
        Ok(deleted > 0)
    }

    pub fn clear(&self) -> rusqlite::Result<usize> {
        self.conn.execute("DELETE FROM sessions", [])
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let tool: String = row.get(1)?;
    let status: String = row.get(3)?;
    Ok(Session {
        id: row.get(0)?,
        tool: parse_column::<ToolKind>(1, &tool)?,
        label: row.get(2)?,
        status: parse_column::<SessionStatus>(3, &status)?,
        last_seen: micros_to_datetime(row.get(4)?),
        created_at: micros_to_datetime(row.get(5)?),
        terminal: row.get(6)?,
        device: row.get(7)?,
        directory: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::Utc;
    use tempfile::TempDir;

    fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open_at(temp_dir.path().join("test.db")).unwrap();
        db.migrate().unwrap();
        (temp_dir, db)
    }

    fn session(id: &str, status: SessionStatus) -> Session {
        let mut s = Session::new(id, ToolKind::Claude, Utc::now());
        s.status = status;
        s
    }

    #[test]
    fn test_upsert_and_get() {
        let (_tmp, db) = setup_test_db();
        let repo = SessionRepository::new(db.conn());

        let mut s = session("alpha", SessionStatus::Starting);
        s.terminal = Some("tmux:%3".to_string());
        s.directory = Some("/work/app".to_string());
        repo.upsert(&s).unwrap();

        let loaded = repo.get("alpha").unwrap().unwrap();
        assert_eq!(loaded.tool, ToolKind::Claude);
        assert_eq!(loaded.status, SessionStatus::Starting);
        assert_eq!(loaded.terminal.as_deref(), Some("tmux:%3"));
        assert_eq!(loaded.directory.as_deref(), Some("/work/app"));
    }

    #[test]
    fn test_upsert_updates_existing_row() {
        let (_tmp, db) = setup_test_db();
        let repo = SessionRepository::new(db.conn());

        let mut s = session("alpha", SessionStatus::Starting);
        repo.upsert(&s).unwrap();
        s.status = SessionStatus::Listening;
        s.label = "reviewer".to_string();
        repo.upsert(&s).unwrap();

        assert_eq!(repo.list(None).unwrap().len(), 1);
        let loaded = repo.get("alpha").unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Listening);
        assert_eq!(loaded.label, "reviewer");
    }

    #[test]
    fn test_list_filters_by_status() {
        let (_tmp, db) = setup_test_db();
        let repo = SessionRepository::new(db.conn());
        repo.upsert(&session("a", SessionStatus::Listening)).unwrap();
        repo.upsert(&session("b", SessionStatus::Idle)).unwrap();
        repo.upsert(&session("c", SessionStatus::Listening)).unwrap();

        let listening = repo.list(Some(SessionStatus::Listening)).unwrap();
        assert_eq!(
            listening.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
    }

    #[test]
    fn test_list_by_device() {
        let (_tmp, db) = setup_test_db();
        let repo = SessionRepository::new(db.conn());
        let mut remote = session("a:WXYZ", SessionStatus::Active);
        remote.device = Some("WXYZ".to_string());
        repo.upsert(&remote).unwrap();
        repo.upsert(&session("b", SessionStatus::Active)).unwrap();

        assert_eq!(repo.list_by_device("WXYZ").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_and_clear() {
        let (_tmp, db) = setup_test_db();
        let repo = SessionRepository::new(db.conn());
        repo.upsert(&session("a", SessionStatus::Active)).unwrap();
        repo.upsert(&session("b", SessionStatus::Active)).unwrap();

        assert!(repo.delete("a").unwrap());
        assert!(!repo.delete("a").unwrap());
        assert_eq!(repo.clear().unwrap(), 1);
        assert!(repo.list(None).unwrap().is_empty());
    }
}
