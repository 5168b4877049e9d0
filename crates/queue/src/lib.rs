//! Event queue for Chatline.
//!
//! - [`EventProducer`]: keyed publishing with timeouts, retries and an
//!   optional background batcher
//! - [`EventConsumer`]: ordered pull loop driving each record through an
//!   explicit retry/dead-letter state machine
//! - Transports: [`InMemoryBroker`] and, with the `sqlite` feature,
//!   [`SqliteBroker`] for producer and consumer in separate processes

pub mod consumer;
pub mod memory;
pub mod producer;
pub mod state;
pub mod stats;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use consumer::EventConsumer;
pub use memory::{InMemoryBroker, InMemoryReader};
pub use producer::EventProducer;
pub use state::{Outcome, RecordState};
pub use stats::ConsumerStats;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteBroker, SqliteReader};
