//! Message model shared by the store and its collaborators.

use crate::metadata::MessageMetadata;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Lenient parse used on the write path: anything unrecognized is a user message.
    pub fn normalize(raw: &str) -> Self {
        raw.parse().unwrap_or(Role::User)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("Unknown role: {}", other)),
        }
    }
}

/// What a message represents inside the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Normal,
    /// Prompt asking the model to compact the history
    CompactPrompt,
    /// Model-written summary replacing compacted history
    CompactSummary,
}

impl MessageKind {
    /// Unknown or absent kinds are normal messages.
    pub fn normalize(raw: Option<&str>) -> Self {
        raw.and_then(|k| k.parse().ok()).unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Normal => "normal",
            MessageKind::CompactPrompt => "compact_prompt",
            MessageKind::CompactSummary => "compact_summary",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "normal" => Ok(MessageKind::Normal),
            "compact_prompt" => Ok(MessageKind::CompactPrompt),
            "compact_summary" => Ok(MessageKind::CompactSummary),
            other => Err(format!("Unknown message kind: {}", other)),
        }
    }
}

/// One content fragment of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    File {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        call_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        call_id: String,
        #[serde(default)]
        output: Value,
        #[serde(default)]
        is_error: bool,
    },
    Data {
        name: String,
        #[serde(default)]
        data: Value,
    },
    /// UI-only boundary between model steps; never persisted.
    StepStart,
    /// The user interrupted this turn.
    ManualStop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl MessagePart {
    pub fn type_name(&self) -> &'static str {
        match self {
            MessagePart::Text { .. } => "text",
            MessagePart::Reasoning { .. } => "reasoning",
            MessagePart::File { .. } => "file",
            MessagePart::ToolCall { .. } => "tool-call",
            MessagePart::ToolResult { .. } => "tool-result",
            MessagePart::Data { .. } => "data",
            MessagePart::StepStart => "step-start",
            MessagePart::ManualStop { .. } => "manual-stop",
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        MessagePart::Text {
            text: content.into(),
        }
    }

    /// Parts that only drive the live UI and are dropped before persistence.
    pub fn is_transient(&self) -> bool {
        matches!(self, MessagePart::StepStart)
    }

    pub fn is_manual_stop(&self) -> bool {
        matches!(self, MessagePart::ManualStop { .. })
    }
}

/// Remove transient parts, keeping order.
pub fn persistable_parts(parts: Vec<MessagePart>) -> Vec<MessagePart> {
    parts.into_iter().filter(|p| !p.is_transient()).collect()
}

/// Message payload as received from a collaborator, before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInput {
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl MessageInput {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role: role.as_str().to_string(),
            ..Default::default()
        }
    }

    pub fn with_part(mut self, part: MessagePart) -> Self {
        self.parts.push(part);
        self
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind.as_str().to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = match metadata {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self
    }
}

/// A persisted tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNode {
    pub id: String,
    pub session_id: String,
    pub parent_id: Option<String>,
    pub path: String,
    pub role: Role,
    pub kind: MessageKind,
    pub parts: Vec<MessagePart>,
    pub metadata: Option<MessageMetadata>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Position of a node in its session tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    pub id: String,
    pub parent_id: Option<String>,
    pub path: String,
}

/// Result of a `save_message_node` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// A new node was created.
    Inserted(NodeRef),
    /// An existing assistant/system node absorbed a partial write.
    Updated(NodeRef),
    /// The id already existed as a user message; nothing changed.
    Unchanged(NodeRef),
    /// Empty non-user message; nothing was written.
    Skipped { id: String, parent_id: Option<String> },
}

impl SaveOutcome {
    /// Stored position, or `None` when the write was skipped.
    pub fn node(&self) -> Option<&NodeRef> {
        match self {
            SaveOutcome::Inserted(node)
            | SaveOutcome::Updated(node)
            | SaveOutcome::Unchanged(node) => Some(node),
            SaveOutcome::Skipped { .. } => None,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            SaveOutcome::Inserted(node)
            | SaveOutcome::Updated(node)
            | SaveOutcome::Unchanged(node) => &node.id,
            SaveOutcome::Skipped { id, .. } => id,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.node().is_some()
    }
}
