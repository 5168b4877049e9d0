//! In-memory backend — useful for testing and ephemeral sessions.

use async_trait::async_trait;
use chatline_core::error::StoreError;
use chatline_core::message::{Message, Session};
use chatline_core::store::{MessageStore, SessionStore};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::RwLock;

struct StoredMessage {
    message: Message,
    /// Creation time given by the producer, 0 when stamped on receipt.
    origin_at: i64,
}

#[derive(Default)]
struct State {
    messages: Vec<StoredMessage>,
    sessions: Vec<Session>,
    next_message_id: i64,
    next_session_id: i64,
}

impl State {
    fn check_insert(&self, message: &Message, origin_at: i64) -> Result<(), StoreError> {
        let clash = self.messages.iter().any(|row| {
            let m = &row.message;
            (message.id != 0 && m.id == message.id)
                || (m.session_id == message.session_id
                    && m.role == message.role
                    && row.origin_at == origin_at
                    && m.content == message.content)
        });
        if clash {
            return Err(StoreError::Conflict(format!(
                "message already stored in session {}",
                message.session_id
            )));
        }
        Ok(())
    }

    fn push(&mut self, message: &Message, origin_at: i64) -> i64 {
        let id = if message.id == 0 {
            self.next_message_id + 1
        } else {
            message.id
        };
        self.next_message_id = self.next_message_id.max(id);
        self.messages.push(StoredMessage {
            message: Message {
                id,
                ..message.clone()
            },
            origin_at,
        });
        id
    }

    fn session_messages(&self, session_id: i64) -> Vec<Message> {
        let mut msgs: Vec<Message> = self
            .messages
            .iter()
            .filter(|row| row.message.session_id == session_id)
            .map(|row| row.message.clone())
            .collect();
        msgs.sort_by_key(|m| (m.created_at, m.id));
        msgs
    }
}

/// Sessions and messages kept in process memory.
///
/// Tests can make the next inserts fail, or take the whole store offline,
/// to exercise retry and fallback paths.
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    failing_inserts: AtomicU32,
    offline: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            failing_inserts: AtomicU32::new(0),
            offline: AtomicBool::new(false),
        }
    }

    /// Fail the next `n` message inserts with a storage error.
    pub fn fail_next_inserts(&self, n: u32) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    /// Make every operation fail until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every stored message across all sessions.
    pub async fn all_messages(&self) -> Vec<Message> {
        self.state
            .read()
            .await
            .messages
            .iter()
            .map(|row| row.message.clone())
            .collect()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("store offline".into()));
        }
        Ok(())
    }

    async fn insert_one(&self, message: &Message, origin_at: i64) -> Result<i64, StoreError> {
        self.check_online()?;
        self.take_insert_failure()?;
        let mut state = self.state.write().await;
        state.check_insert(message, origin_at)?;
        Ok(state.push(message, origin_at))
    }

    fn take_insert_failure(&self) -> Result<(), StoreError> {
        let injected = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Storage("injected insert failure".into()));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert(&self, message: &Message) -> Result<i64, StoreError> {
        self.insert_one(message, message.created_at.timestamp_millis()).await
    }

    async fn insert_unstamped(&self, message: &Message) -> Result<i64, StoreError> {
        self.insert_one(message, 0).await
    }

    async fn insert_batch(&self, messages: &[Message]) -> Result<Vec<i64>, StoreError> {
        self.check_online()?;
        self.take_insert_failure()?;
        let mut state = self.state.write().await;

        // A conflict rolls the whole batch back.
        let start = state.messages.len();
        let next_id = state.next_message_id;
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            let origin_at = message.created_at.timestamp_millis();
            if let Err(e) = state.check_insert(message, origin_at) {
                state.messages.truncate(start);
                state.next_message_id = next_id;
                return Err(e);
            }
            ids.push(state.push(message, origin_at));
        }
        Ok(ids)
    }

    async fn find_by_session(&self, session_id: i64) -> Result<Vec<Message>, StoreError> {
        self.check_online()?;
        Ok(self.state.read().await.session_messages(session_id))
    }

    async fn find_recent(&self, session_id: i64, limit: usize) -> Result<Vec<Message>, StoreError> {
        self.check_online()?;
        let mut msgs = self.state.read().await.session_messages(session_id);
        let skip = msgs.len().saturating_sub(limit);
        Ok(msgs.split_off(skip))
    }

    async fn count_by_session(&self, session_id: i64) -> Result<usize, StoreError> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .filter(|row| row.message.session_id == session_id)
            .count())
    }

    async fn delete_by_session(&self, session_id: i64) -> Result<usize, StoreError> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let before = state.messages.len();
        state.messages.retain(|row| row.message.session_id != session_id);
        Ok(before - state.messages.len())
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, session: &Session) -> Result<Session, StoreError> {
        self.check_online()?;
        let mut state = self.state.write().await;
        state.next_session_id += 1;
        let created = Session {
            id: state.next_session_id,
            ..session.clone()
        };
        state.sessions.push(created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Session>, StoreError> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state.sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn find_by_user(&self, user_id: i64) -> Result<Vec<Session>, StoreError> {
        self.check_online()?;
        let state = self.state.read().await;
        let mut sessions: Vec<Session> = state
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(sessions)
    }

    async fn update_title(&self, id: i64, title: &str) -> Result<(), StoreError> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        session.title = title.to_string();
        Ok(())
    }

    async fn touch_updated_at(&self, id: i64) -> Result<(), StoreError> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let before = state.sessions.len();
        state.sessions.retain(|s| s.id != id);
        Ok(state.sessions.len() < before)
    }
}
