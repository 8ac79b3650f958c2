//! Storage engine for branching chat conversations.
//!
//! Every session is a tree of messages addressed by materialized paths (`01/02/01`), so that
//! edit-and-resend and regenerate create siblings, and streaming continuations of one assistant
//! turn merge into the same node.

pub mod config;
pub mod error;
pub mod metadata;
pub mod model;
pub mod session;
pub mod title;
pub mod tree;

pub use config::{StoreConfig, load_config};
pub use error::{ConversationError, ConversationResult};
pub use model::{
    MessageInput, MessageKind, MessageNode, MessagePart, NodeRef, Role, SaveOutcome,
};
pub use session::{
    ConversationStore, SaveMessageRequest, Session, SessionBinding, SqliteConversationStore,
};
pub use title::normalize_session_title;
