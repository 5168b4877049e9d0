//! Queue handler that writes consumed envelopes to the durable store.

use async_trait::async_trait;
use chatline_core::error::HandlerError;
use chatline_core::message::{Envelope, Message, now_millis};
use chatline_core::queue::EnvelopeHandler;
use chatline_core::store::MessageStore;
use std::sync::Arc;
use tracing::debug;

/// Append-only persistence of chat envelopes.
///
/// Replays are idempotent: a duplicate id or a duplicate natural key
/// surfaces as a store conflict, which counts as success. Envelopes without
/// a creation time are stamped on receipt, and their natural key leaves the
/// stamp out so a replay still conflicts.
pub struct PersistenceHandler {
    store: Arc<dyn MessageStore>,
}

impl PersistenceHandler {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EnvelopeHandler for PersistenceHandler {
    fn name(&self) -> &str {
        "persistence"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let mut message = Message::from(envelope.clone());
        let inserted = if envelope.created_at == 0 {
            message.created_at = now_millis();
            self.store.insert_unstamped(&message).await
        } else {
            self.store.insert(&message).await
        };

        match inserted {
            Ok(id) => {
                debug!(session_id = message.session_id, id, role = %message.role, "Message persisted");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!(session_id = message.session_id, id = envelope.id, "Message already persisted");
                Ok(())
            }
            Err(e) => Err(HandlerError::Store(e)),
        }
    }
}
