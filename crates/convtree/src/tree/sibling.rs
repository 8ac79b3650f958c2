//! Next-sibling allocation under a parent.

use crate::error::ConversationResult;
use crate::tree::path;
use rusqlite::{Connection, OptionalExtension, params};

/// Path of the last sibling under `parent_id` (greatest path, ties broken by id desc).
///
/// Served by `idx_messages_siblings`, so this stays a single index lookup regardless of how many
/// children the parent already has.
pub fn last_sibling_path(
    conn: &Connection,
    session_id: &str,
    parent_id: Option<&str>,
) -> ConversationResult<Option<String>> {
    let path = conn
        .query_row(
            "SELECT path FROM messages WHERE session_id = ? AND parent_id IS ? ORDER BY path DESC, id DESC LIMIT 1",
            params![session_id, parent_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(path)
}

/// Sequence number the next child of `parent_id` should take.
///
/// Callers must hold the database write lock (an IMMEDIATE transaction) between this read and
/// the insert that consumes the sequence.
pub fn next_seq(
    conn: &Connection,
    session_id: &str,
    parent_id: Option<&str>,
) -> ConversationResult<i64> {
    Ok(last_sibling_path(conn, session_id, parent_id)?
        .map(|last| path::last_segment_seq(&last) + 1)
        .unwrap_or(1))
}
