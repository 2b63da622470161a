use rusqlite::Connection;

use crate::error::Result;

/// Open (or create) the daemon database and initialise the schema.
///
/// WAL mode keeps concurrent readers cheap while the daemon's single writer
/// holds the connection mutex.
pub fn open_database(path: &std::path::Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    init_db(&conn)?;
    Ok(conn)
}

/// Create every table and index. Safe to call on each startup; uses
/// `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            username      TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role          TEXT NOT NULL DEFAULT 'pending',
            user_type     TEXT NOT NULL DEFAULT 'brain',
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id         TEXT PRIMARY KEY,
            user_id    INTEGER NOT NULL REFERENCES users(id),
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id         TEXT PRIMARY KEY,
            mind_name  TEXT,
            channel    TEXT NOT NULL,
            type       TEXT NOT NULL,
            name       TEXT UNIQUE,
            title      TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS participants (
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            user_id         INTEGER NOT NULL REFERENCES users(id),
            role            TEXT NOT NULL DEFAULT 'member',
            UNIQUE(conversation_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            role            TEXT NOT NULL,
            sender_name     TEXT,
            content         TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages (conversation_id, id);

        CREATE TABLE IF NOT EXISTS mind_history (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            mind       TEXT NOT NULL,
            channel    TEXT,
            session    TEXT,
            sender     TEXT,
            message_id INTEGER,
            type       TEXT NOT NULL,
            content    TEXT,
            metadata   TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_history_mind
            ON mind_history (mind, id);

        CREATE TABLE IF NOT EXISTS delivery_queue (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            mind       TEXT NOT NULL,
            session    TEXT,
            channel    TEXT,
            sender     TEXT,
            status     TEXT NOT NULL DEFAULT 'pending',
            payload    TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_delivery_mind_status
            ON delivery_queue (mind, status);

        CREATE TABLE IF NOT EXISTS activity (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            type       TEXT NOT NULL,
            mind       TEXT NOT NULL,
            summary    TEXT,
            metadata   TEXT,
            created_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}
