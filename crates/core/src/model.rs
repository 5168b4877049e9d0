//! Chat model trait — the abstraction over generative-model backends.
//!
//! A model takes an ordered role/content sequence and answers it, either as a
//! complete string or as a stream of text deltas. Summarization is expressed
//! on top of plain chat so every backend gets it for free.
//!
//! Implementations: OpenAI-compatible endpoints, scripted fakes in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ModelError;
use crate::message::{Message, Role};

/// System prompt used for summarization requests.
pub const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a summarization assistant. Summarize the main points of the conversation concisely.";

/// Instruction prefixed to the transcript being summarized.
pub const SUMMARY_INSTRUCTION: &str =
    "Summarize the following conversation in no more than 200 words:\n\n";

/// One role-tagged entry of a prompt sent to a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

impl From<&Message> for ChatTurn {
    fn from(msg: &Message) -> Self {
        Self::new(msg.role, msg.content.clone())
    }
}

/// Receiving half of a streamed reply: text deltas in order, then the
/// channel closes. An `Err` item aborts the stream.
pub type DeltaReceiver = mpsc::Receiver<Result<String, ModelError>>;

/// Build the two-turn prompt that asks a model to summarize `turns`.
///
/// Only user and assistant lines make it into the transcript.
pub fn summary_prompt(turns: &[ChatTurn]) -> Vec<ChatTurn> {
    let mut transcript = String::from(SUMMARY_INSTRUCTION);
    for turn in turns {
        match turn.role {
            Role::User => {
                transcript.push_str("User: ");
                transcript.push_str(&turn.content);
                transcript.push('\n');
            }
            Role::Assistant => {
                transcript.push_str("Assistant: ");
                transcript.push_str(&turn.content);
                transcript.push('\n');
            }
            Role::System => {}
        }
    }
    vec![ChatTurn::system(SUMMARY_SYSTEM_PROMPT), ChatTurn::user(transcript)]
}

/// The generative-model capability.
///
/// The chat service calls `stream_chat()`, the context assembler calls
/// `summarize()`; neither knows which backend is behind the trait.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// A human-readable name for this backend (e.g., "openai", "scripted").
    fn name(&self) -> &str;

    /// Send a prompt and get the complete reply.
    async fn chat(&self, turns: &[ChatTurn]) -> Result<String, ModelError>;

    /// Send a prompt and get the reply as a stream of text deltas.
    ///
    /// Default implementation calls `chat()` and yields the result as a single delta.
    async fn stream_chat(&self, turns: &[ChatTurn]) -> Result<DeltaReceiver, ModelError> {
        let reply = self.chat(turns).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(Ok(reply)).await;
        Ok(rx)
    }

    /// Compress `turns` into a short summary.
    async fn summarize(&self, turns: &[ChatTurn]) -> Result<String, ModelError> {
        self.chat(&summary_prompt(turns)).await
    }
}
