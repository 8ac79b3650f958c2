//! The `save_message_node` write path.
//!
//! Normalization happens before any lock is taken; everything that touches the database runs in
//! one IMMEDIATE transaction per attempt so that the sibling read and the insert that consumes
//! it see the same snapshot.

use crate::config::StoreConfig;
use crate::error::{ConversationError, ConversationResult};
use crate::metadata::{self, MessageMetadata};
use crate::model::{
    MessageKind, MessagePart, NodeRef, Role, SaveOutcome, persistable_parts,
};
use crate::session::binder::{self, SessionBinding};
use crate::session::sqlite_storage::{format_timestamp, now_timestamp};
use crate::session::store::SaveMessageRequest;
use crate::title;
use crate::tree::{path, sibling};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, ffi, params};
use time::OffsetDateTime;

/// A save request after role/kind/parts/metadata normalization.
#[derive(Debug, Clone)]
pub(crate) struct PreparedMessage {
    pub session_id: String,
    pub id: String,
    pub parent_id: Option<String>,
    pub role: Role,
    pub kind: MessageKind,
    pub parts: Vec<MessagePart>,
    pub metadata: Option<MessageMetadata>,
    pub allow_empty: bool,
    /// Creation time, already in storage format.
    pub created_at: String,
    /// Title derived from a qualifying user message, if any.
    pub title_candidate: Option<String>,
    pub binding: SessionBinding,
}

impl PreparedMessage {
    pub fn from_request(request: SaveMessageRequest) -> ConversationResult<Self> {
        let SaveMessageRequest {
            session_id,
            message,
            parent_id,
            allow_empty,
            created_at,
            binding,
        } = request;

        let session_id = session_id.trim().to_string();
        if session_id.is_empty() {
            return Err(ConversationError::InvalidInput(
                "session id is required".to_string(),
            ));
        }
        let id = message.id.trim().to_string();
        if id.is_empty() {
            return Err(ConversationError::InvalidInput(
                "message id is required".to_string(),
            ));
        }
        let parent_id = parent_id
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        let role = Role::normalize(&message.role);
        let kind = MessageKind::normalize(message.kind.as_deref());
        let parts = persistable_parts(message.parts);
        let metadata = metadata::sanitize(message.metadata)?;
        let created_at = format_timestamp(&created_at.unwrap_or_else(OffsetDateTime::now_utc))?;

        let title_candidate = if role == Role::User && kind != MessageKind::CompactPrompt {
            Some(title::derive_title(&parts)).filter(|t| !t.is_empty())
        } else {
            None
        };

        Ok(Self {
            session_id,
            id,
            parent_id,
            role,
            kind,
            parts,
            metadata,
            allow_empty,
            created_at,
            title_candidate,
            binding,
        })
    }

    /// Empty non-user turns carry nothing worth replaying.
    pub fn should_skip(&self) -> bool {
        self.role != Role::User && self.parts.is_empty() && !self.allow_empty
    }
}

/// Stored state of a message id seen before.
struct ExistingNode {
    session_id: String,
    parent_id: Option<String>,
    path: String,
    role: Role,
    parts: Vec<MessagePart>,
    metadata: Option<MessageMetadata>,
}

/// Run the save transaction, retrying sibling collisions up to the configured limit.
pub(crate) fn save_with_retry(
    conn: &mut Connection,
    message: &PreparedMessage,
    config: &StoreConfig,
) -> ConversationResult<SaveOutcome> {
    if message.should_skip() {
        log::debug!(
            "Skipping empty {} message {} in session {}",
            message.role,
            message.id,
            message.session_id
        );
        return Ok(SaveOutcome::Skipped {
            id: message.id.clone(),
            parent_id: message.parent_id.clone(),
        });
    }

    let target = format!("message {} in session {}", message.id, message.session_id);
    retry_on_sibling_race(config.sibling_retry_limit, &target, |attempt| {
        save_once(conn, message, &config.default_title, attempt)
    })
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or `limit` attempts have
/// raced. Attempts are numbered from 1.
pub(crate) fn retry_on_sibling_race<T>(
    limit: u32,
    target: &str,
    mut attempt: impl FnMut(u32) -> ConversationResult<T>,
) -> ConversationResult<T> {
    let limit = limit.max(1);
    let mut current = 1;
    loop {
        match attempt(current) {
            Err(err) if err.is_retryable() && current < limit => {
                log::warn!(
                    "Sibling path collision saving {} (attempt {}/{}), retrying",
                    target,
                    current,
                    limit
                );
                current += 1;
            }
            result => return result,
        }
    }
}

pub(crate) fn save_once(
    conn: &mut Connection,
    message: &PreparedMessage,
    placeholder_title: &str,
    attempt: u32,
) -> ConversationResult<SaveOutcome> {
    let now = now_timestamp()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let title_on_create = message
        .title_candidate
        .as_deref()
        .unwrap_or(placeholder_title);
    binder::ensure(&tx, &message.session_id, title_on_create, &now)?;
    binder::bind(&tx, &message.session_id, &message.binding, &now)?;

    let outcome = match load_existing(&tx, &message.id)? {
        Some(existing) => update_existing(&tx, message, existing, &now)?,
        None => insert_new(&tx, message, &now, attempt)?,
    };

    if let Some(title) = &message.title_candidate {
        binder::apply_derived_title(&tx, &message.session_id, title, placeholder_title, &now)?;
    }
    if !matches!(outcome, SaveOutcome::Unchanged(_)) {
        tx.execute(
            "UPDATE sessions SET updated_at = ? WHERE id = ?",
            params![now, message.session_id],
        )?;
    }

    tx.commit()?;
    Ok(outcome)
}

fn load_existing(conn: &Connection, message_id: &str) -> ConversationResult<Option<ExistingNode>> {
    let row = conn
        .query_row(
            "SELECT session_id, parent_id, path, role, parts, metadata FROM messages WHERE id = ?",
            params![message_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((session_id, parent_id, path, role, parts, metadata)) = row else {
        return Ok(None);
    };
    Ok(Some(ExistingNode {
        session_id,
        parent_id,
        path,
        role: Role::normalize(&role),
        parts: serde_json::from_str(&parts)?,
        metadata: metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
    }))
}

fn update_existing(
    conn: &Connection,
    message: &PreparedMessage,
    existing: ExistingNode,
    now: &str,
) -> ConversationResult<SaveOutcome> {
    if existing.session_id != message.session_id {
        return Err(ConversationError::CrossSessionConflict {
            message_id: message.id.clone(),
            owner_session_id: existing.session_id,
            requested_session_id: message.session_id.clone(),
        });
    }

    if message.parent_id != existing.parent_id {
        log::debug!(
            "Message {} already stored under parent {:?}; ignoring requested parent {:?}",
            message.id,
            existing.parent_id,
            message.parent_id
        );
    }
    let node = NodeRef {
        id: message.id.clone(),
        parent_id: existing.parent_id,
        path: existing.path,
    };

    if existing.role == Role::User {
        return Ok(SaveOutcome::Unchanged(node));
    }

    let metadata = metadata::merge(existing.metadata, message.metadata.clone());
    let parts = if message.parts.is_empty() {
        existing.parts
    } else {
        metadata::preserve_stop_marker(&existing.parts, message.parts.clone())
    };

    let parts_json = serde_json::to_string(&parts)?;
    let metadata_json = metadata.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "UPDATE messages SET parts = ?, metadata = ?, updated_at = ? WHERE id = ?",
        params![parts_json, metadata_json, now, message.id],
    )?;
    log::debug!(
        "Merged partial write into message {} at {}",
        node.id,
        node.path
    );

    Ok(SaveOutcome::Updated(node))
}

fn insert_new(
    conn: &Connection,
    message: &PreparedMessage,
    now: &str,
    attempt: u32,
) -> ConversationResult<SaveOutcome> {
    let parent_path = match message.parent_id.as_deref() {
        Some(parent_id) => Some(resolve_parent_path(conn, &message.session_id, parent_id)?),
        None => None,
    };

    let seq = sibling::next_seq(conn, &message.session_id, message.parent_id.as_deref())?;
    let path = path::encode(parent_path.as_deref(), seq)?;

    let parts_json = serde_json::to_string(&message.parts)?;
    let metadata_json = message
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let inserted = conn.execute(
        "INSERT INTO messages (id, session_id, parent_id, path, role, kind, parts, metadata, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            message.id,
            message.session_id,
            message.parent_id,
            path,
            message.role.as_str(),
            message.kind.as_str(),
            parts_json,
            metadata_json,
            message.created_at,
            now,
        ],
    );
    match inserted {
        Ok(_) => {}
        // UNIQUE(session_id, path) is the only UNIQUE constraint on messages.
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation
                && err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            return Err(ConversationError::SiblingRace { attempts: attempt });
        }
        Err(err) => return Err(err.into()),
    }

    Ok(SaveOutcome::Inserted(NodeRef {
        id: message.id.clone(),
        parent_id: message.parent_id.clone(),
        path,
    }))
}

fn resolve_parent_path(
    conn: &Connection,
    session_id: &str,
    parent_id: &str,
) -> ConversationResult<String> {
    let parent = conn
        .query_row(
            "SELECT session_id, path FROM messages WHERE id = ?",
            params![parent_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    match parent {
        Some((owner, path)) if owner == session_id => Ok(path),
        _ => Err(ConversationError::ParentNotFound {
            session_id: session_id.to_string(),
            parent_id: parent_id.to_string(),
        }),
    }
}
