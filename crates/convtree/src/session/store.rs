//! Defines the storage interface collaborators use to persist conversation trees.

use crate::error::ConversationResult;
use crate::model::{MessageInput, MessageNode, MessagePart, SaveOutcome};
use crate::session::binder::SessionBinding;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Session row with its sticky bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub title: String,
    /// Set once the user picked a title; derived titles never replace it afterwards.
    pub is_user_rename: bool,
    pub session_preface: Option<String>,
    pub error_message: Option<String>,
    pub workspace_id: Option<String>,
    pub project_id: Option<String>,
    pub board_id: Option<String>,
    pub resource_uris: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Input of [`ConversationStore::save_message_node`].
#[derive(Debug, Clone)]
pub struct SaveMessageRequest {
    pub session_id: String,
    pub message: MessageInput,
    /// `None` attaches the message as a new root.
    pub parent_id: Option<String>,
    /// Persist non-user messages even when they carry no parts.
    pub allow_empty: bool,
    /// Overrides the creation timestamp of a newly inserted node.
    pub created_at: Option<OffsetDateTime>,
    pub binding: SessionBinding,
}

impl SaveMessageRequest {
    pub fn new(session_id: impl Into<String>, message: MessageInput) -> Self {
        Self {
            session_id: session_id.into(),
            message,
            parent_id: None,
            allow_empty: false,
            created_at: None,
            binding: SessionBinding::default(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_parent_id(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn allow_empty(mut self, allow_empty: bool) -> Self {
        self.allow_empty = allow_empty;
        self
    }

    pub fn created_at(mut self, created_at: OffsetDateTime) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_binding(mut self, binding: SessionBinding) -> Self {
        self.binding = binding;
        self
    }
}

/// Asynchronous store for branching conversation trees.
///
/// ## Consistency
///
/// - `save_message_node` is a single atomic transaction: session upsert and binding, lookup of
///   the message id, then either a merge-update or parent resolution plus insert.
/// - Sibling paths are allocated under the database write lock and protected by a unique
///   index; collisions from other connections are retried a bounded number of times.
/// - Readers see committed state only.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create the session if missing and apply sticky bindings.
    async fn ensure_session(
        &self,
        session_id: &str,
        binding: SessionBinding,
    ) -> ConversationResult<Session>;

    /// Retrieves session metadata by id.
    async fn get_session(&self, session_id: &str) -> ConversationResult<Option<Session>>;

    /// Lists sessions, most recently updated first.
    async fn list_sessions(&self) -> ConversationResult<Vec<Session>>;

    /// Store the session preamble unless it already holds the same text.
    async fn ensure_preface(&self, session_id: &str, text: &str) -> ConversationResult<()>;

    /// Insert a message node, or merge a partial write into the node with the same id.
    async fn save_message_node(&self, request: SaveMessageRequest)
    -> ConversationResult<SaveOutcome>;

    /// Append one part to an existing message. Returns false if the message is not in the
    /// session.
    async fn append_message_part(
        &self,
        session_id: &str,
        message_id: &str,
        part: MessagePart,
    ) -> ConversationResult<bool>;

    /// Id of the last node in pre-order: the tip of the rightmost branch.
    async fn resolve_rightmost_leaf_id(&self, session_id: &str)
    -> ConversationResult<Option<String>>;

    /// Explicit rename. `is_user_rename` freezes the title against derived updates.
    async fn update_session_title(
        &self,
        session_id: &str,
        title: &str,
        is_user_rename: bool,
    ) -> ConversationResult<bool>;

    async fn set_session_error_message(
        &self,
        session_id: &str,
        message: &str,
    ) -> ConversationResult<()>;

    async fn clear_session_error_message(&self, session_id: &str) -> ConversationResult<()>;

    async fn get_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> ConversationResult<Option<MessageNode>>;

    /// Every node of the session in tree pre-order.
    async fn list_messages(&self, session_id: &str) -> ConversationResult<Vec<MessageNode>>;

    /// Direct children of `parent_id` (roots for `None`) in sibling order.
    async fn list_children(
        &self,
        session_id: &str,
        parent_id: Option<&str>,
    ) -> ConversationResult<Vec<MessageNode>>;

    /// Root-to-leaf chain ending at `leaf_id`; empty if the leaf is not in the session.
    async fn resolve_branch(
        &self,
        session_id: &str,
        leaf_id: &str,
    ) -> ConversationResult<Vec<MessageNode>>;
}
