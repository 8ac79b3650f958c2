//! Session creation and sticky workspace/project/board bindings.
//!
//! Bindings are sticky: a value is written only when the caller supplies a non-empty one, so
//! a later request without context never erases what an earlier request established.

use crate::error::ConversationResult;
use rusqlite::{Connection, params};

/// Association fields a caller may attach to a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionBinding {
    pub workspace_id: Option<String>,
    pub project_id: Option<String>,
    pub board_id: Option<String>,
    pub resource_uris: Vec<String>,
}

impl SessionBinding {
    pub fn workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn board(mut self, board_id: impl Into<String>) -> Self {
        self.board_id = Some(board_id.into());
        self
    }

    pub fn resource(mut self, uri: impl Into<String>) -> Self {
        self.resource_uris.push(uri.into());
        self
    }

    fn sticky_columns(&self) -> [(&'static str, Option<&str>); 3] {
        [
            ("workspace_id", sticky_value(&self.workspace_id)),
            ("project_id", sticky_value(&self.project_id)),
            ("board_id", sticky_value(&self.board_id)),
        ]
    }
}

fn sticky_value(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Insert the session row if it does not exist. Returns true when it was created.
///
/// An existing title is never touched here.
pub fn ensure(
    conn: &Connection,
    session_id: &str,
    title_on_create: &str,
    now: &str,
) -> ConversationResult<bool> {
    let inserted = conn.execute(
        "INSERT INTO sessions (id, title, is_user_rename, created_at, updated_at) VALUES (?, ?, 0, ?, ?) ON CONFLICT(id) DO NOTHING",
        params![session_id, title_on_create, now, now],
    )?;
    if inserted > 0 {
        log::debug!("Created session {} titled {:?}", session_id, title_on_create);
    }
    Ok(inserted > 0)
}

/// Apply sticky bindings and record resource URIs.
pub fn bind(
    conn: &Connection,
    session_id: &str,
    binding: &SessionBinding,
    now: &str,
) -> ConversationResult<()> {
    for (column, value) in binding.sticky_columns() {
        let Some(value) = value else { continue };
        // Column names come from a fixed list, never from input.
        let sql = format!(
            "UPDATE sessions SET {column} = ?, updated_at = ? WHERE id = ? AND {column} IS NOT ?"
        );
        conn.execute(&sql, params![value, now, session_id, value])?;
    }

    for uri in binding
        .resource_uris
        .iter()
        .map(|u| u.trim())
        .filter(|u| !u.is_empty())
    {
        conn.execute(
            "INSERT OR IGNORE INTO session_resources (session_id, uri, created_at) VALUES (?, ?, ?)",
            params![session_id, uri, now],
        )?;
    }
    Ok(())
}

/// Replace the placeholder title with a derived one, unless the user renamed the session or
/// a title was already applied.
pub fn apply_derived_title(
    conn: &Connection,
    session_id: &str,
    title: &str,
    placeholder: &str,
    now: &str,
) -> ConversationResult<bool> {
    if title.is_empty() || title == placeholder {
        return Ok(false);
    }
    let affected = conn.execute(
        "UPDATE sessions SET title = ?, updated_at = ? WHERE id = ? AND is_user_rename = 0 AND title = ?",
        params![title, now, session_id, placeholder],
    )?;
    Ok(affected > 0)
}
