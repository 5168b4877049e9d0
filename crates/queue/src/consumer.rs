//! Event consumer — ordered pull loop with bounded retry and dead-lettering.
//!
//! One record at a time is driven through [`RecordState`] until it reaches a
//! terminal outcome, and only then is its offset committed. A record whose
//! handling is interrupted by cancellation is left uncommitted, so the group
//! redelivers it later.

use crate::state::{Outcome, RecordState, StepInput};
use crate::stats::{ConsumerStats, StatsRecorder};
use chatline_config::ConsumerConfig;
use chatline_core::error::QueueError;
use chatline_core::message::Envelope;
use chatline_core::queue::{
    DLQ_ERROR_HEADER, DLQ_SOURCE_OFFSET_HEADER, DLQ_SOURCE_PARTITION_HEADER,
    DLQ_SOURCE_TOPIC_HEADER, EnvelopeHandler, FetchedRecord, PartitionReader, PublishOptions,
    RecordSink,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempts made to publish one dead-letter record before giving up on it.
const DLQ_PUBLISH_ATTEMPTS: u32 = 3;

pub struct EventConsumer {
    reader: Arc<dyn PartitionReader>,
    dlq: Arc<dyn RecordSink>,
    dlq_topic: String,
    handlers: Vec<Arc<dyn EnvelopeHandler>>,
    config: ConsumerConfig,
    stats: Arc<StatsRecorder>,
}

/// Why a record did not reach a terminal outcome.
enum Interrupted {
    Cancelled,
}

impl EventConsumer {
    pub fn new(
        reader: Arc<dyn PartitionReader>,
        dlq: Arc<dyn RecordSink>,
        dlq_topic: impl Into<String>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            reader,
            dlq,
            dlq_topic: dlq_topic.into(),
            handlers: Vec::new(),
            config,
            stats: Arc::new(StatsRecorder::default()),
        }
    }

    /// Add a handler. Handlers run in registration order on every attempt.
    pub fn register_handler(&mut self, handler: Arc<dyn EnvelopeHandler>) {
        info!(handler = handler.name(), "Registered consumer handler");
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> ConsumerStats {
        self.stats.snapshot()
    }

    /// Pull and process records until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            topic = self.reader.topic(),
            partitions = ?self.reader.assignment(),
            group = %self.config.group_id,
            handlers = self.handlers.len(),
            "Consumer started"
        );
        if self.handlers.is_empty() {
            warn!("No handlers registered; records will be read and committed");
        }

        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                fetched = self.reader.fetch(self.config.max_wait()) => fetched,
            };

            match fetched {
                Ok(Some(record)) => {
                    StatsRecorder::incr(&self.stats.fetched);
                    if let Err(Interrupted::Cancelled) = self.process(&record, &cancel).await {
                        info!(
                            partition = record.partition,
                            offset = record.offset,
                            "Cancelled mid-record; leaving it uncommitted"
                        );
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    StatsRecorder::incr(&self.stats.fetch_errors);
                    warn!(error = %e, "Fetch failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.max_wait()) => {}
                    }
                }
            }
        }

        info!(stats = %self.stats(), "Consumer stopped");
    }

    /// Run the loop on its own task.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Drive one record from `Fetched` to `Done`.
    async fn process(
        &self,
        record: &FetchedRecord,
        cancel: &CancellationToken,
    ) -> Result<Outcome, Interrupted> {
        let max_retry = self.config.max_retry.max(1);
        let mut envelope: Option<Envelope> = None;
        let mut state = RecordState::Fetched;

        loop {
            let input = match &state {
                RecordState::Parsing => match Envelope::decode(&record.record.value) {
                    Ok(env) => {
                        envelope = Some(env);
                        StepInput::Succeeded
                    }
                    Err(e) => {
                        StatsRecorder::incr(&self.stats.parse_failures);
                        warn!(
                            partition = record.partition,
                            offset = record.offset,
                            error = %e,
                            "Malformed envelope"
                        );
                        StepInput::Failed(e.to_string())
                    }
                },
                RecordState::Dispatching { attempt } => match &envelope {
                    Some(env) => match self.dispatch(env).await {
                        Ok(()) => StepInput::Succeeded,
                        Err(reason) => {
                            StatsRecorder::incr(&self.stats.handler_failures);
                            warn!(
                                session_id = env.session_id,
                                partition = record.partition,
                                offset = record.offset,
                                attempt,
                                error = %reason,
                                "Handler failed"
                            );
                            StepInput::Failed(reason)
                        }
                    },
                    None => StepInput::Failed("no envelope to dispatch".into()),
                },
                RecordState::Backoff { next_attempt } => {
                    let delay = self.config.backoff_for(next_attempt - 1);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Interrupted::Cancelled),
                        _ = tokio::time::sleep(delay) => StepInput::Proceed,
                    }
                }
                RecordState::DeadLetter { reason } => {
                    self.dead_letter(record, reason).await;
                    StepInput::Proceed
                }
                RecordState::Commit { outcome } => {
                    self.commit(record, *outcome).await;
                    StepInput::Proceed
                }
                RecordState::Done { outcome } => return Ok(*outcome),
                _ => StepInput::Proceed,
            };

            let next = state.step(input, max_retry);
            debug!(partition = record.partition, offset = record.offset, state = next.name(), "Record state");
            state = next;
        }
    }

    /// One attempt: every handler in order, stopping at the first failure.
    async fn dispatch(&self, envelope: &Envelope) -> Result<(), String> {
        for handler in &self.handlers {
            handler
                .handle(envelope)
                .await
                .map_err(|e| format!("{}: {e}", handler.name()))?;
        }
        Ok(())
    }

    async fn dead_letter(&self, record: &FetchedRecord, reason: &str) {
        let reason = if reason.trim().is_empty() {
            "unknown failure"
        } else {
            reason
        };
        let quarantined = record
            .record
            .clone()
            .with_header(DLQ_ERROR_HEADER, reason)
            .with_header(DLQ_SOURCE_TOPIC_HEADER, record.topic.clone())
            .with_header(DLQ_SOURCE_PARTITION_HEADER, record.partition.to_string())
            .with_header(DLQ_SOURCE_OFFSET_HEADER, record.offset.to_string());

        let options = PublishOptions::default();
        for attempt in 1..=DLQ_PUBLISH_ATTEMPTS {
            match self
                .dlq
                .publish(&self.dlq_topic, vec![quarantined.clone()], &options)
                .await
            {
                Ok(()) => {
                    StatsRecorder::incr(&self.stats.dead_lettered);
                    warn!(
                        partition = record.partition,
                        offset = record.offset,
                        dlq_topic = %self.dlq_topic,
                        reason,
                        "Record dead-lettered"
                    );
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Dead-letter publish failed");
                }
            }
        }
        StatsRecorder::incr(&self.stats.dlq_failures);
        error!(
            partition = record.partition,
            offset = record.offset,
            reason,
            "Record could not be dead-lettered; committing past it"
        );
    }

    async fn commit(&self, record: &FetchedRecord, outcome: Outcome) {
        let timeout = self.config.commit_timeout();
        let result = if timeout.is_zero() {
            self.reader.commit(record).await
        } else {
            match tokio::time::timeout(timeout, self.reader.commit(record)).await {
                Ok(result) => result,
                Err(_) => Err(QueueError::Commit(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                ))),
            }
        };

        match result {
            Ok(()) => {
                if outcome == Outcome::Committed {
                    StatsRecorder::incr(&self.stats.committed);
                }
                debug!(partition = record.partition, offset = record.offset, %outcome, "Offset committed");
            }
            Err(e) => {
                StatsRecorder::incr(&self.stats.commit_failures);
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Offset commit failed; record may be redelivered"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;
    use async_trait::async_trait;
    use chatline_core::error::HandlerError;
    use chatline_core::message::{Message, Role};
    use chatline_core::queue::{Record, StartOffset};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const TOPIC: &str = "chat.messages";
    const DLQ: &str = "chat.messages.dlq";

    /// Records every envelope and fails the first `fail_first` calls.
    struct Recorder {
        name: String,
        calls: AtomicU32,
        fail_first: u32,
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new(name: &str, fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                calls: AtomicU32::new(0),
                fail_first,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EnvelopeHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(HandlerError::Rejected(format!("refused call {n}")));
            }
            self.seen.lock().unwrap().push(envelope.content.clone());
            Ok(())
        }
    }

    fn config(max_retry: u32) -> ConsumerConfig {
        ConsumerConfig {
            max_retry,
            retry_backoff_ms: 10,
            max_wait_ms: 20,
            start_offset: StartOffset::Earliest,
            ..ConsumerConfig::default()
        }
    }

    async fn publish_envelopes(broker: &InMemoryBroker, session_id: i64, contents: &[&str]) {
        let records = contents
            .iter()
            .map(|c| Record::from_envelope(&Envelope::from(&Message::new(session_id, Role::User, *c))))
            .collect();
        broker.publish(TOPIC, records, &PublishOptions::default()).await.unwrap();
    }

    async fn consumer(broker: &InMemoryBroker, cfg: ConsumerConfig) -> EventConsumer {
        let reader = broker.reader(TOPIC, &cfg.group_id, vec![0], StartOffset::Earliest).await;
        EventConsumer::new(Arc::new(reader), Arc::new(broker.clone()), DLQ, cfg)
    }

    /// Run until `done` holds or a generous deadline passes.
    async fn run_until(consumer: Arc<EventConsumer>, done: impl Fn(&ConsumerStats) -> bool) -> ConsumerStats {
        let cancel = CancellationToken::new();
        let handle = consumer.clone().spawn(cancel.clone());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !done(&consumer.stats()) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        consumer.stats()
    }

    #[tokio::test]
    async fn dispatches_in_fetch_order_and_commits() {
        let broker = InMemoryBroker::new(1);
        publish_envelopes(&broker, 1, &["a", "b", "c"]).await;
        let handler = Recorder::new("recorder", 0);
        let mut c = consumer(&broker, config(3)).await;
        c.register_handler(handler.clone());

        let stats = run_until(Arc::new(c), |s| s.committed == 3).await;
        assert_eq!(stats.committed, 3);
        assert_eq!(*handler.seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(broker.committed_offset("chatline-consumer", TOPIC, 0).await, Some(3));
        assert!(broker.records(DLQ).await.is_empty());
    }

    #[tokio::test]
    async fn always_failing_handler_runs_max_retry_times_then_dead_letters() {
        let broker = InMemoryBroker::new(1);
        publish_envelopes(&broker, 9, &["doomed"]).await;
        let handler = Recorder::new("persist", u32::MAX);
        let mut c = consumer(&broker, config(3)).await;
        c.register_handler(handler.clone());

        let stats = run_until(Arc::new(c), |s| s.dead_lettered == 1).await;
        assert_eq!(handler.calls(), 3);
        assert_eq!(stats.handler_failures, 3);
        assert_eq!(stats.committed, 0);

        let dlq = broker.records(DLQ).await;
        assert_eq!(dlq.len(), 1);
        let quarantined = &dlq[0].record;
        assert_eq!(quarantined.key, "9");
        assert_eq!(Envelope::decode(&quarantined.value).unwrap().content, "doomed");
        assert!(!quarantined.header(DLQ_ERROR_HEADER).unwrap().is_empty());
        assert_eq!(quarantined.header(DLQ_SOURCE_TOPIC_HEADER), Some(TOPIC));
        assert_eq!(quarantined.header(DLQ_SOURCE_PARTITION_HEADER), Some("0"));
        assert_eq!(quarantined.header(DLQ_SOURCE_OFFSET_HEADER), Some("0"));
        assert_eq!(broker.committed_offset("chatline-consumer", TOPIC, 0).await, Some(1));
    }

    #[tokio::test]
    async fn dead_letter_does_not_block_the_partition() {
        let broker = InMemoryBroker::new(1);
        publish_envelopes(&broker, 9, &["doomed", "next"]).await;
        let handler = Recorder::new("persist", 1);
        let mut c = consumer(&broker, config(1)).await;
        c.register_handler(handler.clone());

        let stats = run_until(Arc::new(c), |s| s.committed == 1 && s.dead_lettered == 1).await;
        assert_eq!(handler.calls(), 2);
        assert_eq!(stats.handler_failures, 1);
        assert_eq!(*handler.seen.lock().unwrap(), vec!["next"]);
    }

    #[tokio::test]
    async fn first_failing_handler_aborts_the_attempt() {
        let broker = InMemoryBroker::new(1);
        publish_envelopes(&broker, 1, &["x"]).await;
        let first = Recorder::new("first", 1);
        let second = Recorder::new("second", 0);
        let mut c = consumer(&broker, config(3)).await;
        c.register_handler(first.clone());
        c.register_handler(second.clone());

        run_until(Arc::new(c), |s| s.committed == 1).await;
        assert_eq!(first.calls(), 2);
        assert_eq!(second.calls(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered_without_dispatch() {
        let broker = InMemoryBroker::new(1);
        broker
            .publish(TOPIC, vec![Record::new("4", b"{not json".to_vec())], &PublishOptions::default())
            .await
            .unwrap();
        let handler = Recorder::new("never", 0);
        let mut c = consumer(&broker, config(3)).await;
        c.register_handler(handler.clone());

        let stats = run_until(Arc::new(c), |s| s.dead_lettered == 1).await;
        assert_eq!(stats.parse_failures, 1);
        assert_eq!(handler.calls(), 0);
        let dlq = broker.records(DLQ).await;
        assert_eq!(dlq[0].record.value, b"{not json");
        assert_eq!(broker.committed_offset("chatline-consumer", TOPIC, 0).await, Some(1));
    }

    #[tokio::test]
    async fn no_handlers_still_commits() {
        let broker = InMemoryBroker::new(1);
        publish_envelopes(&broker, 1, &["a", "b"]).await;
        let c = consumer(&broker, config(3)).await;
        assert_eq!(c.handler_count(), 0);
        let stats = run_until(Arc::new(c), |s| s.committed == 2).await;
        assert_eq!(stats.committed, 2);
    }

    #[tokio::test]
    async fn commit_failure_is_counted_not_retried() {
        let broker = InMemoryBroker::new(1);
        publish_envelopes(&broker, 1, &["a", "b"]).await;
        broker.fail_next_commits(1);
        let handler = Recorder::new("h", 0);
        let mut c = consumer(&broker, config(3)).await;
        c.register_handler(handler.clone());

        let stats = run_until(Arc::new(c), |s| s.committed == 1 && s.commit_failures == 1).await;
        assert_eq!(stats.commit_failures, 1);
        assert_eq!(handler.calls(), 2);
        // The later commit advances past the record whose commit failed.
        assert_eq!(broker.committed_offset("chatline-consumer", TOPIC, 0).await, Some(2));
    }

    #[tokio::test]
    async fn cancellation_during_backoff_leaves_record_uncommitted() {
        let broker = InMemoryBroker::new(1);
        publish_envelopes(&broker, 1, &["stuck"]).await;
        let handler = Recorder::new("slow", u32::MAX);
        let cfg = ConsumerConfig {
            retry_backoff_ms: 60_000,
            ..config(3)
        };
        let mut c = consumer(&broker, cfg).await;
        c.register_handler(handler.clone());
        let c = Arc::new(c);

        let cancel = CancellationToken::new();
        let handle = c.clone().spawn(cancel.clone());
        while handler.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("consumer stops promptly")
            .unwrap();

        assert_eq!(handler.calls(), 1);
        assert!(broker.records(DLQ).await.is_empty());
        assert_eq!(broker.committed_offset("chatline-consumer", TOPIC, 0).await, None);

        // A fresh member of the group sees the record again.
        let reader = broker.reader(TOPIC, "chatline-consumer", vec![0], StartOffset::Earliest).await;
        let again = reader.fetch(Duration::from_millis(20)).await.unwrap().unwrap();
        assert_eq!(again.offset, 0);
    }

    #[tokio::test]
    async fn cancel_while_idle_stops_the_loop() {
        let broker = InMemoryBroker::new(1);
        let c = Arc::new(consumer(&broker, config(3)).await);
        let cancel = CancellationToken::new();
        let handle = c.clone().spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(c.stats(), ConsumerStats::default());
    }
}
