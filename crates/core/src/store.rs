//! Durable store traits — the system of record for sessions and messages.
//!
//! The cache is a performance layer and the queue is transit; only these
//! stores decide what a conversation durably contains.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::message::{Message, Session};

/// Durable message rows.
///
/// Implementations: SQLite, in-memory (for testing).
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Insert one message and return its row id.
    ///
    /// When `message.id` is non-zero that id is used verbatim. Inserting an
    /// id that already exists, or a row identical to an existing one in
    /// session, role, creation time and content, fails with
    /// [`StoreError::Conflict`].
    async fn insert(&self, message: &Message) -> Result<i64, StoreError>;

    /// Insert a message that arrived without a creation time and was stamped
    /// on receipt.
    ///
    /// Its natural key ignores the stamp: storing the same unstamped
    /// session, role and content twice fails with [`StoreError::Conflict`],
    /// whatever `created_at` each attempt was given.
    async fn insert_unstamped(&self, message: &Message) -> Result<i64, StoreError>;

    /// Insert many messages atomically: all rows land or none do.
    async fn insert_batch(&self, messages: &[Message]) -> Result<Vec<i64>, StoreError>;

    /// Every message of a session, oldest first.
    async fn find_by_session(&self, session_id: i64) -> Result<Vec<Message>, StoreError>;

    /// The newest `limit` messages of a session, returned oldest first.
    async fn find_recent(&self, session_id: i64, limit: usize) -> Result<Vec<Message>, StoreError>;

    async fn count_by_session(&self, session_id: i64) -> Result<usize, StoreError>;

    /// Remove every message of a session. Returns how many rows went away.
    async fn delete_by_session(&self, session_id: i64) -> Result<usize, StoreError>;
}

/// Durable session rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    fn name(&self) -> &str;

    /// Insert a session and return it with its assigned id.
    async fn create(&self, session: &Session) -> Result<Session, StoreError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<Session>, StoreError>;

    /// Sessions of a user, most recently updated first.
    async fn find_by_user(&self, user_id: i64) -> Result<Vec<Session>, StoreError>;

    async fn update_title(&self, id: i64, title: &str) -> Result<(), StoreError>;

    /// Bump `updated_at` to now.
    async fn touch_updated_at(&self, id: i64) -> Result<(), StoreError>;

    /// Delete a session. Returns `false` if it did not exist.
    async fn delete(&self, id: i64) -> Result<bool, StoreError>;
}
