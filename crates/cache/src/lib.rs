//! Per-session message cache for Chatline.
//!
//! [`MessageCache`] keeps one bounded, TTL'd, chronologically ordered list
//! per session on top of any [`ListStore`](chatline_core::ListStore) backend.

pub mod in_memory;
pub mod message_cache;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryListStore;
pub use message_cache::MessageCache;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteListStore;
