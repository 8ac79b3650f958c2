//! Database schema initialization
//!
//! Sessions and messages are keyed by caller-supplied string ids. Tree position lives in the
//! `path` column; `UNIQUE(session_id, path)` is the last line of defence against two writers
//! allocating the same sibling sequence.

use rusqlite::Connection;

/// Create tables and indexes if they do not exist yet
pub fn init_schema(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY NOT NULL,
            title TEXT NOT NULL,
            is_user_rename INTEGER NOT NULL DEFAULT 0,
            session_preface TEXT,
            error_message TEXT,
            workspace_id TEXT,
            project_id TEXT,
            board_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at);

        -- Append-only set of resources a session has touched
        CREATE TABLE IF NOT EXISTS session_resources (
            session_id TEXT NOT NULL,
            uri TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY(session_id, uri),
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY NOT NULL,
            session_id TEXT NOT NULL,
            parent_id TEXT,
            path TEXT NOT NULL,
            role TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'normal',
            parts TEXT NOT NULL,
            metadata TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(session_id, path),
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE,
            FOREIGN KEY(parent_id) REFERENCES messages(id)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_siblings ON messages(session_id, parent_id, path);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_schema(&mut conn).unwrap();
        init_schema(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(tables, vec!["messages", "session_resources", "sessions"]);
    }
}
