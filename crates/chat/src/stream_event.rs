//! Chat-level streaming events.
//!
//! `ChatStreamEvent` is what a caller relaying a reply (a terminal, a socket)
//! receives while the model answers:
//! - `delta` — partial text of the reply
//! - `done`  — the reply is complete
//! - `error` — generation failed; nothing was recorded for the reply

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    /// Partial text from the model.
    Delta { content: String },

    /// The full reply, as recorded.
    Done { session_id: i64, content: String },

    /// Generation failed mid-stream.
    Error { message: String },
}

impl ChatStreamEvent {
    /// Event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta { .. })
    }
}
