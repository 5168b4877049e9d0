//! Message, session, and envelope domain types.
//!
//! These are the value objects that flow through the whole pipeline:
//! user sends a message → cache append + queue publish → consumer persists it
//! durably → context assembly reads it back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::QueueError;

/// Title given to sessions before the first exchange names them.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions and summaries
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
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
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Current time truncated to millisecond precision, the resolution every
/// store and the wire format keep.
pub fn now_millis() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap_or_default()
}

/// A single message in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Durable row id. `0` means "not yet durably persisted".
    pub id: i64,

    /// Owning session
    pub session_id: i64,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Creation time (millisecond precision)
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create an unpersisted message stamped with the current time.
    pub fn new(session_id: i64, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            session_id,
            role,
            content: content.into(),
            created_at: now_millis(),
        }
    }

    /// Create a new user message.
    pub fn user(session_id: i64, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(session_id: i64, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::Assistant, content)
    }

    /// Whether the durable store has assigned this message an id.
    pub fn is_persisted(&self) -> bool {
        self.id != 0
    }
}

/// A conversation session owned by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    /// Touched on every exchange.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A fresh, unpersisted session with the default title.
    pub fn new(user_id: i64) -> Self {
        let now = now_millis();
        Self {
            id: 0,
            user_id,
            title: DEFAULT_SESSION_TITLE.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Wire representation of one message, used as the queue payload and as the
/// cached list element.
///
/// Field names are stable; unknown fields are ignored on decode so the shape
/// can grow additively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: i64,
    pub session_id: i64,
    pub role: Role,
    pub content: String,
    /// Unix milliseconds. `0` means "unstamped".
    pub created_at: i64,
}

impl Envelope {
    /// Encode to the JSON wire form.
    pub fn encode(&self) -> Vec<u8> {
        // A struct of plain scalars and strings always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode from the JSON wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, QueueError> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::Parse(e.to_string()))
    }

    /// Partition key: all envelopes of one session share a partition.
    pub fn partition_key(&self) -> String {
        self.session_id.to_string()
    }
}

impl From<&Message> for Envelope {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id,
            session_id: msg.session_id,
            role: msg.role,
            content: msg.content.clone(),
            created_at: msg.created_at.timestamp_millis(),
        }
    }
}

impl From<Envelope> for Message {
    fn from(env: Envelope) -> Self {
        Self {
            id: env.id,
            session_id: env.session_id,
            role: env.role,
            content: env.content,
            created_at: DateTime::from_timestamp_millis(env.created_at).unwrap_or_default(),
        }
    }
}
