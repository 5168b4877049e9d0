//! # Chatline Storage
//!
//! Durable sessions and messages, plus the read/write-through repository
//! that fronts them with the message cache.
//!
//! Backends:
//! - **SQLite** — production store (sqlx, WAL)
//! - **In-memory** — tests and ephemeral runs

pub mod in_memory;
pub mod persist;
pub mod repository;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;
pub use persist::PersistenceHandler;
pub use repository::MessageRepository;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteStore, connect};
