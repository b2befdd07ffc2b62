//! Conversation types: messages, turns and the end-of-session record

use serde::{Deserialize, Serialize};

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed conversation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Commit sequence number, strictly increasing within a session
    pub seq: u64,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, seq: u64) -> Self {
        Self {
            role,
            content: content.into(),
            seq,
        }
    }
}

/// Turn identifier, monotonic within a session
pub type TurnId = u64;

/// Who owns a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnOwner {
    User,
    Assistant,
}

impl TurnOwner {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOwner::User => "user",
            TurnOwner::Assistant => "assistant",
        }
    }
}

/// Turn lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Active,
    Completing,
    Cancelled,
    Done,
}

impl TurnStatus {
    /// Whether the turn can still change state
    pub fn is_open(&self) -> bool {
        matches!(self, TurnStatus::Active | TurnStatus::Completing)
    }
}

/// One span of speech or generation attributed to a single participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub owner: TurnOwner,
    pub status: TurnStatus,
}

impl Turn {
    pub fn new(id: TurnId, owner: TurnOwner) -> Self {
        Self {
            id,
            owner,
            status: TurnStatus::Active,
        }
    }
}

/// Role/content pair of the final conversation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub role: Role,
    pub content: String,
}

/// Completed conversation emitted at session end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub connection_id: String,
    pub messages: Vec<RecordEntry>,
}

impl ConversationRecord {
    /// Build from committed messages, preserving commit order
    pub fn from_messages(connection_id: impl Into<String>, messages: &[Message]) -> Self {
        Self {
            connection_id: connection_id.into(),
            messages: messages
                .iter()
                .map(|m| RecordEntry {
                    role: m.role,
                    content: m.content.clone(),
                })
                .collect(),
        }
    }

    /// Number of messages by role
    pub fn count(&self, role: Role) -> usize {
        self.messages.iter().filter(|m| m.role == role).count()
    }
}
