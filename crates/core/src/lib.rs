//! # Chatline Core
//!
//! Domain types, traits, and error definitions for the Chatline chat backend.
//! This crate has **no runtime backends** — it defines the domain model that
//! all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external capability (list store, queue transport, durable store,
//! generative model) is a trait here. Implementations live in their
//! respective crates, so tests swap in in-process fakes and the dependency
//! graph points inward on core.

pub mod cache;
pub mod error;
pub mod message;
pub mod model;
pub mod queue;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use cache::ListStore;
pub use error::{CacheError, Error, HandlerError, ModelError, QueueError, Result, StoreError};
pub use message::{DEFAULT_SESSION_TITLE, Envelope, Message, Role, Session};
pub use model::{ChatModel, ChatTurn, DeltaReceiver};
pub use queue::{
    Acks, Compression, EnvelopeHandler, FetchedRecord, PartitionReader, PublishOptions, Record,
    RecordSink, StartOffset,
};
pub use store::{MessageStore, SessionStore};
