//! Read-through / write-through message access.
//!
//! The cache answers reads when it can; the durable store is the fallback and
//! the source of truth. A durable read for a session the cache does not hold
//! spawns a warm-up task that loads those rows into the cache.

use chatline_cache::MessageCache;
use chatline_core::error::{CacheError, StoreError};
use chatline_core::message::Message;
use chatline_core::store::MessageStore;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

pub struct MessageRepository {
    store: Arc<dyn MessageStore>,
    cache: Arc<MessageCache>,
    warmups: TaskTracker,
    warming: Arc<Mutex<HashSet<i64>>>,
    cancel: CancellationToken,
}

impl MessageRepository {
    pub fn new(store: Arc<dyn MessageStore>, cache: Arc<MessageCache>) -> Self {
        Self {
            store,
            cache,
            warmups: TaskTracker::new(),
            warming: Arc::new(Mutex::new(HashSet::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Persist durably, then append to the cache. A cache failure is logged;
    /// the returned message carries its durable id.
    pub async fn create(&self, message: &Message) -> Result<Message, StoreError> {
        let id = self.store.insert(message).await?;
        let created = Message {
            id,
            ..message.clone()
        };
        if let Err(e) = self.cache.append(&created).await {
            warn!(session_id = created.session_id, error = %e, "Cache append after durable write failed");
        }
        Ok(created)
    }

    /// Hot-path append; durability comes from the queue.
    pub async fn append_to_cache(&self, message: &Message) -> Result<(), CacheError> {
        self.cache.append(message).await
    }

    /// Every message of the session, oldest first.
    ///
    /// A partial cache (expired and refilled by new appends, or trimmed) is
    /// merged with the durable history.
    pub async fn find_by_session(&self, session_id: i64) -> Result<Vec<Message>, StoreError> {
        let cached = self.cached(session_id, self.cache.get_all(session_id).await);
        if cached.is_empty() {
            let durable = self.store.find_by_session(session_id).await?;
            self.spawn_warmup(session_id, &durable);
            return Ok(durable);
        }

        match self.reconcile(session_id, &cached).await {
            Ok(total) if total <= cached.len() => {
                debug!(session_id, count = cached.len(), "History served from cache");
                return Ok(cached);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(session_id, error = %e, "Durable store unavailable, serving cached history");
                return Ok(cached);
            }
        }
        let durable = self.store.find_by_session(session_id).await?;
        Ok(merge(durable, cached, usize::MAX))
    }

    /// The newest `limit` messages of the session, oldest first.
    pub async fn find_recent(&self, session_id: i64, limit: usize) -> Result<Vec<Message>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let cached = self.cached(session_id, self.cache.get_recent(session_id, limit).await);
        if cached.len() >= limit {
            return Ok(cached);
        }

        if cached.is_empty() {
            let durable = self.store.find_recent(session_id, limit).await?;
            // Warm with the full history so later reads see the whole window.
            let history = self.store.find_by_session(session_id).await?;
            self.spawn_warmup(session_id, &history);
            return Ok(durable);
        }

        match self.reconcile(session_id, &cached).await {
            Ok(total) if total <= cached.len() => return Ok(cached),
            Ok(_) => {}
            Err(e) => {
                warn!(session_id, error = %e, "Durable store unavailable, serving cached window");
                return Ok(cached);
            }
        }
        let durable = self.store.find_recent(session_id, limit).await?;
        Ok(merge(durable, cached, limit))
    }

    /// Durable rows plus cached messages not yet persisted.
    pub async fn count_by_session(&self, session_id: i64) -> Result<usize, StoreError> {
        let cached = self.cached(session_id, self.cache.get_all(session_id).await);
        if cached.is_empty() {
            return self.store.count_by_session(session_id).await;
        }
        match self.reconcile(session_id, &cached).await {
            Ok(total) => Ok(total.max(cached.len())),
            Err(e) => {
                warn!(session_id, error = %e, "Durable count failed, using cache count");
                Ok(cached.len())
            }
        }
    }

    /// Drop the cached list, then the durable rows.
    pub async fn delete_by_session(&self, session_id: i64) -> Result<usize, StoreError> {
        if let Err(e) = self.cache.delete(session_id).await {
            warn!(session_id, error = %e, "Cache delete failed");
        }
        self.store.delete_by_session(session_id).await
    }

    /// Wait until every warm-up spawned so far has finished.
    pub async fn wait_for_warmups(&self) {
        self.warmups.close();
        self.warmups.wait().await;
        self.warmups.reopen();
    }

    /// Cancel outstanding warm-ups and wait for them to stop.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.wait_for_warmups().await;
    }

    /// Size of the whole session: durable rows plus the cached messages the
    /// consumer has not persisted yet.
    ///
    /// Cached messages are the newest of the session, so any of them already
    /// persisted is among the newest `cached.len()` durable rows.
    async fn reconcile(&self, session_id: i64, cached: &[Message]) -> Result<usize, StoreError> {
        let durable = self.store.count_by_session(session_id).await?;
        if durable == 0 {
            return Ok(cached.len());
        }
        let tail = self.store.find_recent(session_id, cached.len()).await?;
        let pending = cached
            .iter()
            .filter(|m| !tail.iter().any(|d| same_message(d, m)))
            .count();
        Ok(durable + pending)
    }

    fn cached(&self, session_id: i64, result: Result<Vec<Message>, CacheError>) -> Vec<Message> {
        match result {
            Ok(messages) => messages,
            Err(e) => {
                warn!(session_id, error = %e, "Cache read failed, using durable store");
                Vec::new()
            }
        }
    }

    fn spawn_warmup(&self, session_id: i64, messages: &[Message]) {
        if messages.is_empty() || self.cancel.is_cancelled() {
            return;
        }
        // One warm-up per session at a time.
        match self.warming.lock() {
            Ok(mut warming) => {
                if !warming.insert(session_id) {
                    return;
                }
            }
            Err(_) => return,
        }
        let warming = self.warming.clone();
        let cache = self.cache.clone();
        let cancel = self.cancel.child_token();
        let messages = messages.to_vec();
        self.warmups.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(session_id, "Cache warm-up cancelled");
                }
                result = warm(&cache, session_id, &messages) => {
                    if let Err(e) = result {
                        warn!(session_id, error = %e, "Cache warm-up failed");
                    }
                }
            }
            if let Ok(mut warming) = warming.lock() {
                warming.remove(&session_id);
            }
        });
    }
}

async fn warm(cache: &MessageCache, session_id: i64, messages: &[Message]) -> Result<(), CacheError> {
    // Someone appended in the meantime; loading older rows now would misorder the list.
    if cache.exists(session_id).await? {
        return Ok(());
    }
    cache.batch_append(messages).await?;
    debug!(session_id, count = messages.len(), "Cache warmed from durable store");
    Ok(())
}

/// Union of durable rows and cached rows not yet persisted, oldest first,
/// keeping the newest `limit`.
fn merge(durable: Vec<Message>, cached: Vec<Message>, limit: usize) -> Vec<Message> {
    let mut merged = durable;
    for message in cached {
        if !merged.iter().any(|m| same_message(m, &message)) {
            merged.push(message);
        }
    }
    merged.sort_by_key(|m| m.created_at);
    let skip = merged.len().saturating_sub(limit);
    merged.split_off(skip)
}

/// Same row: equal ids, or equal natural keys for a message not yet given one.
fn same_message(a: &Message, b: &Message) -> bool {
    (a.id != 0 && a.id == b.id)
        || (a.role == b.role && a.created_at == b.created_at && a.content == b.content)
}
