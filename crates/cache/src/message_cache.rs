//! Session-scoped message cache.
//!
//! One list per session under `"{prefix}:{session_id}:messages"`, each
//! element an envelope in wire form. Every append refreshes the TTL and trims
//! the head so the list never exceeds `max_len`.

use chatline_config::CacheConfig;
use chatline_core::cache::ListStore;
use chatline_core::error::CacheError;
use chatline_core::message::{Envelope, Message};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct MessageCache {
    store: Arc<dyn ListStore>,
    key_prefix: String,
    max_len: usize,
    ttl: Duration,
}

impl MessageCache {
    pub fn new(store: Arc<dyn ListStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            key_prefix: config.key_prefix.clone(),
            max_len: config.max_len,
            ttl: config.ttl(),
        }
    }

    /// The list key for `session_id`.
    pub fn key(&self, session_id: i64) -> String {
        format!("{}:{}:messages", self.key_prefix, session_id)
    }

    fn encode(message: &Message) -> Result<String, CacheError> {
        serde_json::to_string(&Envelope::from(message)).map_err(|e| CacheError::Codec(e.to_string()))
    }

    fn decode(raw: &[String]) -> Result<Vec<Message>, CacheError> {
        raw.iter()
            .map(|v| {
                serde_json::from_str::<Envelope>(v)
                    .map(Message::from)
                    .map_err(|e| CacheError::Codec(e.to_string()))
            })
            .collect()
    }

    /// Append one message to its session's list.
    pub async fn append(&self, message: &Message) -> Result<(), CacheError> {
        let value = Self::encode(message)?;
        self.store
            .push_trim_expire(&self.key(message.session_id), vec![value], self.max_len, self.ttl)
            .await
    }

    /// Append many messages of one session as a single atomic unit.
    pub async fn batch_append(&self, messages: &[Message]) -> Result<(), CacheError> {
        let Some(first) = messages.first() else {
            return Ok(());
        };
        let session_id = first.session_id;
        if messages.iter().any(|m| m.session_id != session_id) {
            return Err(CacheError::Codec(
                "batch_append requires messages of a single session".into(),
            ));
        }

        let values = messages
            .iter()
            .map(Self::encode)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(session_id, count = values.len(), "Cache batch append");
        self.store
            .push_trim_expire(&self.key(session_id), values, self.max_len, self.ttl)
            .await
    }

    /// Every cached message of the session, oldest first.
    pub async fn get_all(&self, session_id: i64) -> Result<Vec<Message>, CacheError> {
        let raw = self.store.range(&self.key(session_id), 0, -1).await?;
        Self::decode(&raw)
    }

    /// The newest `n` cached messages, oldest first.
    pub async fn get_recent(&self, session_id: i64, n: usize) -> Result<Vec<Message>, CacheError> {
        // LRANGE -0 -1 would return the whole list.
        if n == 0 {
            return Ok(Vec::new());
        }
        let start = -i64::try_from(n).unwrap_or(i64::MAX);
        let raw = self.store.range(&self.key(session_id), start, -1).await?;
        Self::decode(&raw)
    }

    pub async fn count(&self, session_id: i64) -> Result<usize, CacheError> {
        self.store.len(&self.key(session_id)).await
    }

    pub async fn exists(&self, session_id: i64) -> Result<bool, CacheError> {
        self.store.exists(&self.key(session_id)).await
    }

    pub async fn delete(&self, session_id: i64) -> Result<(), CacheError> {
        self.store.delete(&self.key(session_id)).await
    }

    /// Slide the session's TTL without touching its messages.
    pub async fn refresh(&self, session_id: i64) -> Result<(), CacheError> {
        if !self.store.expire(&self.key(session_id), self.ttl).await? {
            warn!(session_id, "Refresh on a session that is not cached");
        }
        Ok(())
    }

    /// Longest list the cache keeps per session.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn backend_name(&self) -> &str {
        self.store.name()
    }
}
