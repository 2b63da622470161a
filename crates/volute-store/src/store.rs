use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::Result;

/// Thread-safe handle over the daemon database.
///
/// Wraps a single connection in a mutex, like the rest of the daemon's
/// SQLite subsystems. Every method takes `&self` and is safe to call from
/// any handler.
pub struct StateStore {
    pub(crate) db: Mutex<Connection>,
}

impl StateStore {
    /// Open the database at `path`, creating the schema if needed.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = crate::db::open_database(path)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Wrap an already-open connection. Used by tests with `:memory:` or a
    /// tempdir database.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        crate::db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
