//! Event producer — keyed publishing of envelopes.
//!
//! Every envelope is keyed by its session id, so one session's envelopes
//! share a partition and keep their publish order. In sync mode `send`
//! returns once the sink acknowledged the write; in async mode (or with
//! `acks = none`) records are handed to a background batcher that flushes on
//! size or linger.

use chatline_config::{ProducerConfig, ProducerMode};
use chatline_core::error::QueueError;
use chatline_core::message::Envelope;
use chatline_core::queue::{Acks, PublishOptions, Record, RecordSink};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(1);

/// Depth of the async hand-off channel, in batches.
const CHANNEL_BATCHES: usize = 4;

struct Publisher {
    sink: Arc<dyn RecordSink>,
    topic: String,
    options: PublishOptions,
    write_timeout: Duration,
    max_attempts: u32,
}

impl Publisher {
    /// Publish with a per-write timeout, retrying transport failures until
    /// `max_attempts` total attempts have been made.
    async fn publish(&self, records: Vec<Record>) -> Result<(), QueueError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.write_timeout,
                self.sink.publish(&self.topic, records.clone(), &self.options),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(QueueError::Timeout {
                    timeout_ms: self.write_timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = RETRY_BASE.saturating_mul(attempt).min(RETRY_CAP);
                    warn!(topic = %self.topic, attempt, error = %e, "Publish failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct Batcher {
    tx: mpsc::Sender<Record>,
    handle: JoinHandle<()>,
}

pub struct EventProducer {
    publisher: Arc<Publisher>,
    mode: ProducerMode,
    batched: bool,
    /// `None` for a sync producer, or a batching one after `close()`.
    batcher: Mutex<Option<Batcher>>,
}

impl EventProducer {
    /// Create a producer for `topic`. In async mode (or with `acks = none`)
    /// this spawns the batcher, so it must run inside a Tokio runtime.
    pub fn new(sink: Arc<dyn RecordSink>, topic: impl Into<String>, config: &ProducerConfig) -> Self {
        let publisher = Arc::new(Publisher {
            sink,
            topic: topic.into(),
            options: PublishOptions {
                acks: config.acks,
                compression: config.compression,
            },
            write_timeout: config.write_timeout(),
            max_attempts: config.max_attempts.max(1),
        });

        let batched = config.mode == ProducerMode::Async || config.acks == Acks::None;
        let batcher = batched.then(|| {
            let batch_size = config.batch_size.max(1);
            let (tx, rx) = mpsc::channel(batch_size * CHANNEL_BATCHES);
            let handle = tokio::spawn(run_batcher(
                rx,
                Arc::clone(&publisher),
                batch_size,
                config.linger(),
            ));
            Batcher { tx, handle }
        });

        info!(
            topic = %publisher.topic,
            sink = publisher.sink.name(),
            mode = ?config.mode,
            acks = ?config.acks,
            "Event producer ready"
        );

        Self {
            publisher,
            mode: config.mode,
            batched,
            batcher: Mutex::new(batcher),
        }
    }

    pub fn topic(&self) -> &str {
        &self.publisher.topic
    }

    pub fn mode(&self) -> ProducerMode {
        self.mode
    }

    /// Publish one envelope keyed by its session.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), QueueError> {
        self.dispatch(vec![Record::from_envelope(envelope)]).await
    }

    /// Publish many envelopes. Each keeps its own session key.
    pub async fn send_batch(&self, envelopes: &[Envelope]) -> Result<(), QueueError> {
        if envelopes.is_empty() {
            return Ok(());
        }
        self.dispatch(envelopes.iter().map(Record::from_envelope).collect())
            .await
    }

    async fn dispatch(&self, records: Vec<Record>) -> Result<(), QueueError> {
        let tx = self
            .batcher
            .lock()
            .map_err(|_| QueueError::Closed("producer state poisoned".into()))?
            .as_ref()
            .map(|b| b.tx.clone());

        match tx {
            Some(tx) => {
                for record in records {
                    tx.send(record)
                        .await
                        .map_err(|_| QueueError::Closed("producer is closed".into()))?;
                }
                Ok(())
            }
            None if self.batched => Err(QueueError::Closed("producer is closed".into())),
            None => self.publisher.publish(records).await,
        }
    }

    /// Flush any batched records and stop the batcher. Later sends on a
    /// batching producer fail with [`QueueError::Closed`].
    pub async fn close(&self) {
        let batcher = match self.batcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(Batcher { tx, handle }) = batcher {
            drop(tx);
            if let Err(e) = handle.await {
                warn!(error = %e, "Producer batcher ended abnormally");
            }
            debug!(topic = %self.publisher.topic, "Producer flushed and closed");
        }
    }
}

/// Drain `rx`, flushing whenever `batch_size` records are buffered or the
/// oldest buffered record has waited `linger`. Exits after a final flush
/// once every sender is gone.
async fn run_batcher(
    mut rx: mpsc::Receiver<Record>,
    publisher: Arc<Publisher>,
    batch_size: usize,
    linger: Duration,
) {
    let mut buffer = Vec::with_capacity(batch_size);
    loop {
        let Some(first) = rx.recv().await else {
            break;
        };
        buffer.push(first);

        let deadline = tokio::time::Instant::now() + linger;
        let mut closed = false;
        while buffer.len() < batch_size {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(record)) => buffer.push(record),
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        let batch = std::mem::take(&mut buffer);
        let count = batch.len();
        if let Err(e) = publisher.publish(batch).await {
            warn!(topic = %publisher.topic, count, error = %e, "Dropped batch after publish failure");
        } else {
            debug!(topic = %publisher.topic, count, "Flushed batch");
        }

        if closed {
            break;
        }
    }
}
