//! Error types for conversation tree operations

use thiserror::Error;

/// Errors that can occur while reading or writing the conversation tree
#[derive(Debug, Error)]
pub enum ConversationError {
    /// Missing or malformed caller input (empty ids, invalid metadata)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Sibling sequence outside the encodable range
    #[error("Invalid path segment: {0}")]
    InvalidSegment(i64),

    /// Parent already holds the maximum number of children
    #[error("Too many siblings under {}", parent_path.as_deref().unwrap_or("<root>"))]
    TooManySiblings { parent_path: Option<String> },

    /// Parent id does not resolve inside the session
    #[error("Parent message {parent_id} not found in session {session_id}")]
    ParentNotFound {
        session_id: String,
        parent_id: String,
    },

    /// Message id already belongs to another session
    #[error(
        "Message {message_id} belongs to session {owner_session_id}, not {requested_session_id}"
    )]
    CrossSessionConflict {
        message_id: String,
        owner_session_id: String,
        requested_session_id: String,
    },

    /// Concurrent writers kept colliding on the same sibling path
    #[error("Sibling path allocation raced after {attempts} attempt(s)")]
    SiblingRace { attempts: u32 },

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Result with ConversationError
pub type ConversationResult<T> = Result<T, ConversationError>;

impl ConversationError {
    /// Whether the failure is transient and the operation may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConversationError::SiblingRace { .. })
    }
}

impl From<rusqlite::Error> for ConversationError {
    fn from(err: rusqlite::Error) -> Self {
        ConversationError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for ConversationError {
    fn from(err: serde_json::Error) -> Self {
        ConversationError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_many_siblings_names_root_when_parent_missing() {
        let err = ConversationError::TooManySiblings { parent_path: None };
        assert_eq!(err.to_string(), "Too many siblings under <root>");

        let err = ConversationError::TooManySiblings {
            parent_path: Some("01/03".to_string()),
        };
        assert_eq!(err.to_string(), "Too many siblings under 01/03");
    }

    #[test]
    fn only_sibling_race_is_retryable() {
        assert!(ConversationError::SiblingRace { attempts: 1 }.is_retryable());
        assert!(!ConversationError::InvalidSegment(0).is_retryable());
        assert!(!ConversationError::SessionNotFound("s".into()).is_retryable());
    }
}
