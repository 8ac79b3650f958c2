use crate::config::StoreConfig;
use crate::error::{ConversationError, ConversationResult};
use crate::model::{MessageKind, MessageNode, MessagePart, Role, SaveOutcome};
use crate::session::binder::{self, SessionBinding};
use crate::session::save::{self, PreparedMessage};
use crate::session::schema;
use crate::session::store::{ConversationStore, SaveMessageRequest, Session};
use crate::tree::path;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use std::sync::{Arc, Mutex};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

const SESSION_COLUMNS: &str = "id, title, is_user_rename, session_preface, error_message, workspace_id, project_id, board_id, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, session_id, parent_id, path, role, kind, parts, metadata, created_at, updated_at";

/// SQLite implementation of [`ConversationStore`].
///
/// ## Concurrency Model
///
/// - A single connection guarded by `Arc<Mutex<Connection>>`; each operation runs on
///   `spawn_blocking` and holds the lock only for its own transaction
/// - Writes open `BEGIN IMMEDIATE` transactions, so other processes sharing the database file
///   are serialized by SQLite's write lock (bounded by `busy_timeout`)
/// - Sibling collisions that still slip through (unique index on `(session_id, path)`) are
///   retried `sibling_retry_limit` times before surfacing as `SiblingRace`
#[derive(Clone)]
pub struct SqliteConversationStore {
    conn: Arc<Mutex<Connection>>,
    config: Arc<StoreConfig>,
}

impl SqliteConversationStore {
    /// Open (or create) the database described by `config`.
    pub async fn connect(config: StoreConfig) -> ConversationResult<Self> {
        config
            .validate()
            .map_err(|e| ConversationError::InvalidInput(e.to_string()))?;

        let open_config = config.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, rusqlite::Error> {
            let mut conn = match &open_config.db {
                Some(path) => {
                    let conn = Connection::open(path)?;
                    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
                    conn
                }
                None => Connection::open_in_memory()?,
            };
            conn.busy_timeout(open_config.busy_timeout())?;
            conn.execute("PRAGMA foreign_keys = ON;", [])?;
            schema::init_schema(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| ConversationError::Other(format!("Failed to spawn blocking task: {}", e)))?
        .map_err(ConversationError::from)?;

        if let Some(db) = &config.db {
            log::debug!("Opened conversation store at {}", db.display());
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config: Arc::new(config),
        })
    }

    /// In-memory store with default settings.
    pub async fn in_memory() -> ConversationResult<Self> {
        Self::connect(StoreConfig::default()).await
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn run_blocking<F, R>(&self, f: F) -> ConversationResult<R>
    where
        F: FnOnce(&mut Connection) -> ConversationResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn_arc = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn_arc
                .lock()
                .map_err(|_| ConversationError::Other("Database connection lock poisoned".into()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| ConversationError::Other(format!("Task execution failed: {}", e)))?
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    #[tracing::instrument(name = "convtree.ensure_session", skip(self, binding))]
    async fn ensure_session(
        &self,
        session_id: &str,
        binding: SessionBinding,
    ) -> ConversationResult<Session> {
        let session_id = require_id(session_id, "session id")?;
        let placeholder = self.config.default_title.clone();

        self.run_blocking(move |conn| {
            let now = now_timestamp()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            binder::ensure(&tx, &session_id, &placeholder, &now)?;
            binder::bind(&tx, &session_id, &binding, &now)?;
            let session = fetch_session(&tx, &session_id)?
                .ok_or_else(|| ConversationError::SessionNotFound(session_id.clone()))?;
            tx.commit()?;
            Ok(session)
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> ConversationResult<Option<Session>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| fetch_session(conn, &session_id))
            .await
    }

    async fn list_sessions(&self) -> ConversationResult<Vec<Session>> {
        self.run_blocking(|conn| {
            let ids: Vec<String> = {
                let mut stmt =
                    conn.prepare("SELECT id FROM sessions ORDER BY updated_at DESC, id ASC")?;
                stmt.query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?
            };
            let mut sessions = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(session) = fetch_session(conn, &id)? {
                    sessions.push(session);
                }
            }
            Ok(sessions)
        })
        .await
    }

    #[tracing::instrument(name = "convtree.ensure_preface", skip(self, text))]
    async fn ensure_preface(&self, session_id: &str, text: &str) -> ConversationResult<()> {
        let session_id = require_id(session_id, "session id")?;
        if text.trim().is_empty() {
            return Ok(());
        }
        let text = text.to_string();
        let placeholder = self.config.default_title.clone();

        self.run_blocking(move |conn| {
            let now = now_timestamp()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            binder::ensure(&tx, &session_id, &placeholder, &now)?;
            tx.execute(
                "UPDATE sessions SET session_preface = ?, updated_at = ? WHERE id = ? AND session_preface IS NOT ?",
                params![text, now, session_id, text],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(
        name = "convtree.save_message_node",
        skip(self, request),
        fields(
            session_id = %request.session_id,
            message_id = %request.message.id,
            outcome = tracing::field::Empty
        )
    )]
    async fn save_message_node(
        &self,
        request: SaveMessageRequest,
    ) -> ConversationResult<SaveOutcome> {
        let message = PreparedMessage::from_request(request)?;
        let config = self.config.clone();

        let outcome = self
            .run_blocking(move |conn| save::save_with_retry(conn, &message, &config))
            .await?;

        let label = match &outcome {
            SaveOutcome::Inserted(_) => "inserted",
            SaveOutcome::Updated(_) => "updated",
            SaveOutcome::Unchanged(_) => "unchanged",
            SaveOutcome::Skipped { .. } => "skipped",
        };
        tracing::Span::current().record("outcome", label);
        Ok(outcome)
    }

    async fn append_message_part(
        &self,
        session_id: &str,
        message_id: &str,
        part: MessagePart,
    ) -> ConversationResult<bool> {
        let session_id = session_id.to_string();
        let message_id = message_id.to_string();

        self.run_blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stored = tx
                .query_row(
                    "SELECT parts FROM messages WHERE id = ? AND session_id = ?",
                    params![message_id, session_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            let Some(stored) = stored else {
                return Ok(false);
            };
            if part.is_transient() {
                return Ok(true);
            }

            let mut parts: Vec<MessagePart> = serde_json::from_str(&stored)?;
            parts.push(part);
            let now = now_timestamp()?;
            tx.execute(
                "UPDATE messages SET parts = ?, updated_at = ? WHERE id = ?",
                params![serde_json::to_string(&parts)?, now, message_id],
            )?;
            tx.execute(
                "UPDATE sessions SET updated_at = ? WHERE id = ?",
                params![now, session_id],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn resolve_rightmost_leaf_id(
        &self,
        session_id: &str,
    ) -> ConversationResult<Option<String>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id FROM messages WHERE session_id = ? ORDER BY path DESC, id DESC LIMIT 1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn update_session_title(
        &self,
        session_id: &str,
        title: &str,
        is_user_rename: bool,
    ) -> ConversationResult<bool> {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Ok(false);
        }
        let session_id = session_id.to_string();

        self.run_blocking(move |conn| {
            let now = now_timestamp()?;
            let affected = conn.execute(
                "UPDATE sessions SET title = ?1, is_user_rename = MAX(is_user_rename, ?2), updated_at = ?3 WHERE id = ?4 AND (?2 = 1 OR is_user_rename = 0)",
                params![title, is_user_rename, now, session_id],
            )?;
            Ok(affected > 0)
        })
        .await
    }

    async fn set_session_error_message(
        &self,
        session_id: &str,
        message: &str,
    ) -> ConversationResult<()> {
        self.write_error_message(session_id, Some(message.to_string()))
            .await
    }

    async fn clear_session_error_message(&self, session_id: &str) -> ConversationResult<()> {
        self.write_error_message(session_id, None).await
    }

    async fn get_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> ConversationResult<Option<MessageNode>> {
        let session_id = session_id.to_string();
        let message_id = message_id.to_string();
        self.run_blocking(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ? AND session_id = ?"),
                    params![message_id, session_id],
                    map_row_to_node,
                )
                .optional()?)
        })
        .await
    }

    async fn list_messages(&self, session_id: &str) -> ConversationResult<Vec<MessageNode>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ? ORDER BY path ASC"
            ))?;
            let nodes = stmt
                .query_map(params![session_id], map_row_to_node)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(nodes)
        })
        .await
    }

    async fn list_children(
        &self,
        session_id: &str,
        parent_id: Option<&str>,
    ) -> ConversationResult<Vec<MessageNode>> {
        let session_id = session_id.to_string();
        let parent_id = parent_id.map(str::to_string);
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ? AND parent_id IS ? ORDER BY path ASC"
            ))?;
            let nodes = stmt
                .query_map(params![session_id, parent_id], map_row_to_node)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(nodes)
        })
        .await
    }

    async fn resolve_branch(
        &self,
        session_id: &str,
        leaf_id: &str,
    ) -> ConversationResult<Vec<MessageNode>> {
        let session_id = session_id.to_string();
        let leaf_id = leaf_id.to_string();
        self.run_blocking(move |conn| {
            let leaf_path: Option<String> = conn
                .query_row(
                    "SELECT path FROM messages WHERE id = ? AND session_id = ?",
                    params![leaf_id, session_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(leaf_path) = leaf_path else {
                return Ok(Vec::new());
            };

            let mut paths = path::ancestor_paths(&leaf_path);
            paths.push(leaf_path);
            let placeholders = vec!["?"; paths.len()].join(", ");
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ? AND path IN ({placeholders}) ORDER BY path ASC"
            );

            let mut values = Vec::with_capacity(paths.len() + 1);
            values.push(session_id);
            values.extend(paths);

            let mut stmt = conn.prepare(&sql)?;
            let nodes = stmt
                .query_map(params_from_iter(values.iter()), map_row_to_node)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(nodes)
        })
        .await
    }
}

impl SqliteConversationStore {
    async fn write_error_message(
        &self,
        session_id: &str,
        message: Option<String>,
    ) -> ConversationResult<()> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let now = now_timestamp()?;
            let affected = conn.execute(
                "UPDATE sessions SET error_message = ?, updated_at = ? WHERE id = ?",
                params![message, now, session_id],
            )?;
            if affected == 0 {
                return Err(ConversationError::SessionNotFound(session_id));
            }
            Ok(())
        })
        .await
    }
}

fn require_id(value: &str, label: &str) -> ConversationResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConversationError::InvalidInput(format!("{} is required", label)));
    }
    Ok(value.to_string())
}

/// Format a timestamp for storage: UTC with nine fraction digits, so text order matches time
/// order. Instants outside years 0000..=9999 are rejected.
pub(crate) fn format_timestamp(dt: &OffsetDateTime) -> ConversationResult<String> {
    let utc = dt
        .checked_to_offset(UtcOffset::UTC)
        .filter(|utc| (0..=9999).contains(&utc.year()))
        .ok_or_else(|| ConversationError::InvalidInput(format!("Timestamp out of range: {}", dt)))?;
    utc.format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
    ))
    .map_err(|e| ConversationError::InvalidInput(format!("Unformattable timestamp {}: {}", dt, e)))
}

pub(crate) fn now_timestamp() -> ConversationResult<String> {
    format_timestamp(&OffsetDateTime::now_utc())
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, rusqlite::Error> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    idx: usize,
    value: &str,
) -> Result<T, rusqlite::Error> {
    serde_json::from_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn fetch_session(conn: &Connection, session_id: &str) -> ConversationResult<Option<Session>> {
    let session = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"),
            params![session_id],
            map_row_to_session,
        )
        .optional()?;
    let Some(mut session) = session else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT uri FROM session_resources WHERE session_id = ? ORDER BY created_at ASC, uri ASC",
    )?;
    session.resource_uris = stmt
        .query_map(params![session_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(Some(session))
}

fn map_row_to_session(row: &rusqlite::Row) -> Result<Session, rusqlite::Error> {
    Ok(Session {
        id: row.get(0)?,
        title: row.get(1)?,
        is_user_rename: row.get(2)?,
        session_preface: row.get(3)?,
        error_message: row.get(4)?,
        workspace_id: row.get(5)?,
        project_id: row.get(6)?,
        board_id: row.get(7)?,
        resource_uris: Vec::new(),
        created_at: parse_rfc3339(&row.get::<_, String>(8)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
    })
}

fn map_row_to_node(row: &rusqlite::Row) -> Result<MessageNode, rusqlite::Error> {
    let parts: String = row.get(6)?;
    let metadata: Option<String> = row.get(7)?;
    Ok(MessageNode {
        id: row.get(0)?,
        session_id: row.get(1)?,
        parent_id: row.get(2)?,
        path: row.get(3)?,
        role: Role::normalize(&row.get::<_, String>(4)?),
        kind: MessageKind::normalize(row.get::<_, Option<String>>(5)?.as_deref()),
        parts: parse_json_column(6, &parts)?,
        metadata: metadata
            .as_deref()
            .map(|m| parse_json_column(7, m))
            .transpose()?,
        created_at: parse_rfc3339(&row.get::<_, String>(8)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
    })
}
