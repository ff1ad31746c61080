//! SQLite connection management and schema.

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, Result as SqliteResult};
use std::path::Path;

pub type DbConn<'a> = MutexGuard<'a, Connection>;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path`. `":memory:"` opens a private
    /// in-memory database.
    pub fn new(path: &str) -> SqliteResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        log::warn!("[DB] Could not create {}: {}", parent.display(), e);
                    }
                }
            }
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    pub fn conn(&self) -> DbConn<'_> {
        self.conn.lock()
    }

    fn create_tables(&self) -> SqliteResult<()> {
        let conn = self.conn();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS buffered_spans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload BLOB NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        Ok(())
    }
}
