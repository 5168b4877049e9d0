//! The chat service — sessions and the send-message flow.
//!
//! Writes on the request path never wait for the durable store: messages go
//! to the cache for immediate reads and to the queue for persistence. Cache
//! and queue failures are logged and swallowed; model failures are surfaced
//! and leave no assistant message behind.

use crate::context::ContextAssembler;
use crate::stream_event::ChatStreamEvent;
use chatline_core::error::{ModelError, Result};
use chatline_core::message::{Envelope, Message, Session};
use chatline_core::model::ChatModel;
use chatline_core::store::SessionStore;
use chatline_queue::EventProducer;
use chatline_storage::MessageRepository;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest auto-generated session title, in characters.
const TITLE_MAX_CHARS: usize = 50;

pub struct ChatService {
    sessions: Arc<dyn SessionStore>,
    messages: Arc<MessageRepository>,
    model: Arc<dyn ChatModel>,
    producer: Option<Arc<EventProducer>>,
    context: ContextAssembler,
}

impl ChatService {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        messages: Arc<MessageRepository>,
        model: Arc<dyn ChatModel>,
        producer: Option<Arc<EventProducer>>,
        context: ContextAssembler,
    ) -> Self {
        Self {
            sessions,
            messages,
            model,
            producer,
            context,
        }
    }

    pub fn messages(&self) -> &Arc<MessageRepository> {
        &self.messages
    }

    pub async fn create_session(&self, user_id: i64) -> Result<Session> {
        let session = self.sessions.create(&Session::new(user_id)).await?;
        info!(session_id = session.id, user_id, "Session created");
        Ok(session)
    }

    /// Sessions of a user, most recently active first.
    pub async fn list_sessions(&self, user_id: i64) -> Result<Vec<Session>> {
        Ok(self.sessions.find_by_user(user_id).await?)
    }

    pub async fn get_session(&self, session_id: i64) -> Result<Option<Session>> {
        Ok(self.sessions.find_by_id(session_id).await?)
    }

    /// Full history of a session, oldest first.
    pub async fn get_messages(&self, session_id: i64) -> Result<Vec<Message>> {
        Ok(self.messages.find_by_session(session_id).await?)
    }

    /// Delete the session's messages, then the session. Returns `false` if
    /// the session did not exist.
    pub async fn delete_session(&self, session_id: i64) -> Result<bool> {
        let removed = self.messages.delete_by_session(session_id).await?;
        let existed = self.sessions.delete(session_id).await?;
        info!(session_id, removed, "Session deleted");
        Ok(existed)
    }

    pub async fn update_title(&self, session_id: i64, title: &str) -> Result<()> {
        Ok(self.sessions.update_title(session_id, title).await?)
    }

    /// Answer `content` in `session_id`, passing each reply delta to
    /// `on_delta` as it arrives. Returns the recorded assistant message.
    ///
    /// Cancelling `cancel` aborts generation with [`ModelError::Cancelled`].
    pub async fn send_message<F>(
        &self,
        session_id: i64,
        content: &str,
        mut on_delta: F,
        cancel: &CancellationToken,
    ) -> Result<Message>
    where
        F: FnMut(&str) + Send,
    {
        let user_message = Message::user(session_id, content);
        self.record(&user_message).await;

        let turns = self.context.build_context(session_id, content).await;
        debug!(session_id, turns = turns.len(), model = self.model.name(), "Requesting reply");

        let mut deltas = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ModelError::Cancelled.into()),
            stream = self.model.stream_chat(&turns) => stream?,
        };

        let mut reply = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ModelError::Cancelled.into()),
                next = deltas.recv() => next,
            };
            match next {
                Some(Ok(delta)) => {
                    reply.push_str(&delta);
                    on_delta(&delta);
                }
                Some(Err(e)) => {
                    warn!(session_id, error = %e, "Model stream failed");
                    return Err(e.into());
                }
                None => break,
            }
        }
        if reply.is_empty() {
            return Err(ModelError::EmptyResponse.into());
        }

        let assistant_message = Message::assistant(session_id, reply);
        self.record(&assistant_message).await;

        if let Err(e) = self.sessions.touch_updated_at(session_id).await {
            warn!(session_id, error = %e, "Failed to touch session");
        }
        self.maybe_set_title(session_id, content).await;

        Ok(assistant_message)
    }

    /// Run [`send_message`](Self::send_message) in the background, relaying
    /// its progress as events. The channel closes after a terminal event.
    pub fn stream_message(
        self: &Arc<Self>,
        session_id: i64,
        content: impl Into<String>,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<ChatStreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Arc::clone(self);
        let content = content.into();
        tokio::spawn(async move {
            let delta_tx = tx.clone();
            let result = service
                .send_message(
                    session_id,
                    &content,
                    |delta| {
                        let _ = delta_tx.send(ChatStreamEvent::Delta {
                            content: delta.to_string(),
                        });
                    },
                    &cancel,
                )
                .await;
            let last = match result {
                Ok(message) => ChatStreamEvent::Done {
                    session_id,
                    content: message.content,
                },
                Err(e) => ChatStreamEvent::Error {
                    message: e.to_string(),
                },
            };
            let _ = tx.send(last);
        });
        rx
    }

    /// Cache for immediate reads, queue for persistence. Neither failure
    /// blocks the conversation.
    async fn record(&self, message: &Message) {
        if let Err(e) = self.messages.append_to_cache(message).await {
            warn!(session_id = message.session_id, role = %message.role, error = %e, "Cache append failed");
        }
        if let Some(producer) = &self.producer {
            if let Err(e) = producer.send(&Envelope::from(message)).await {
                warn!(session_id = message.session_id, role = %message.role, error = %e, "Queue publish failed");
            }
        }
    }

    async fn maybe_set_title(&self, session_id: i64, first_message: &str) {
        let count = match self.messages.count_by_session(session_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(session_id, error = %e, "Count failed, leaving title unchanged");
                return;
            }
        };
        if count > 2 {
            return;
        }
        let title = session_title(first_message);
        if let Err(e) = self.sessions.update_title(session_id, &title).await {
            warn!(session_id, error = %e, "Failed to set session title");
        }
    }
}

/// Title derived from the first message: up to 50 characters, with "..."
/// appended when cut.
fn session_title(content: &str) -> String {
    let mut chars = content.chars();
    let mut title: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        title.push_str("...");
    }
    title
}
