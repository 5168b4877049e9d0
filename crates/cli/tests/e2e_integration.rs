//! End-to-end integration tests for the Chatline pipeline.
//!
//! These tests wire the real components together (SQLite store, cache and
//! queue on one database) with a scripted model, and exercise the paths a
//! message takes from `send_message` to a durable row.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatline_cache::{InMemoryListStore, MessageCache, SqliteListStore};
use chatline_chat::{ChatService, ContextAssembler};
use chatline_config::{CacheConfig, ConsumerConfig, ContextConfig, ProducerConfig};
use chatline_core::error::ModelError;
use chatline_core::message::{Envelope, Message, Role};
use chatline_core::model::{ChatModel, ChatTurn};
use chatline_core::queue::{
    DLQ_ERROR_HEADER, DLQ_SOURCE_OFFSET_HEADER, EnvelopeHandler, PartitionReader, PublishOptions, Record,
    RecordSink, StartOffset,
};
use chatline_core::store::{MessageStore, SessionStore};
use chatline_queue::{ConsumerStats, EventConsumer, EventProducer, SqliteBroker};
use chatline_storage::{InMemoryStore, MessageRepository, PersistenceHandler, SqliteStore};
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "chat.messages";
const DLQ_TOPIC: &str = "chat.messages.dlq";
const GROUP: &str = "chatline-consumer";
const PARTITIONS: u32 = 4;

// ── Scripted model ───────────────────────────────────────────────────────

/// Replies with a fixed text and summarizes with a fixed summary, recording
/// what it was asked.
struct ScriptedModel {
    reply: String,
    summary: String,
    prompts: Mutex<Vec<Vec<ChatTurn>>>,
    summarized: Mutex<Vec<Vec<ChatTurn>>>,
}

impl ScriptedModel {
    fn new(reply: &str) -> Self {
        Self {
            reply: reply.into(),
            summary: "the user asked many questions".into(),
            prompts: Mutex::new(Vec::new()),
            summarized: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "e2e_scripted"
    }

    async fn chat(&self, turns: &[ChatTurn]) -> Result<String, ModelError> {
        self.prompts.lock().unwrap().push(turns.to_vec());
        Ok(self.reply.clone())
    }

    async fn summarize(&self, turns: &[ChatTurn]) -> Result<String, ModelError> {
        self.summarized.lock().unwrap().push(turns.to_vec());
        Ok(self.summary.clone())
    }
}

// ── Wiring ───────────────────────────────────────────────────────────────

struct Pipeline {
    store: Arc<SqliteStore>,
    repository: Arc<MessageRepository>,
    broker: Arc<SqliteBroker>,
    producer: Arc<EventProducer>,
}

async fn memory_pool() -> sqlx::SqlitePool {
    sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

async fn pipeline(pool: sqlx::SqlitePool) -> Pipeline {
    let store = Arc::new(SqliteStore::from_pool(pool.clone()).await.unwrap());
    let list_store = Arc::new(SqliteListStore::from_pool(pool.clone()).await.unwrap());
    let cache = Arc::new(MessageCache::new(list_store, &CacheConfig::default()));
    let repository = Arc::new(MessageRepository::new(store.clone(), cache));
    let broker = Arc::new(SqliteBroker::from_pool(pool, PARTITIONS).await.unwrap());
    let producer = Arc::new(EventProducer::new(broker.clone(), TOPIC, &ProducerConfig::default()));
    Pipeline {
        store,
        repository,
        broker,
        producer,
    }
}

fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        start_offset: StartOffset::Earliest,
        max_wait_ms: 50,
        retry_backoff_ms: 10,
        ..ConsumerConfig::default()
    }
}

async fn persistence_consumer(p: &Pipeline, store: Arc<dyn MessageStore>, config: ConsumerConfig) -> Arc<EventConsumer> {
    let reader = p
        .broker
        .reader(TOPIC, GROUP, (0..PARTITIONS).collect(), config.start_offset)
        .await
        .unwrap();
    let mut consumer = EventConsumer::new(Arc::new(reader), p.broker.clone(), DLQ_TOPIC, config);
    consumer.register_handler(Arc::new(PersistenceHandler::new(store)));
    Arc::new(consumer)
}

fn service(p: &Pipeline, model: Arc<ScriptedModel>) -> ChatService {
    let context = ContextAssembler::new(p.repository.clone(), model.clone(), ContextConfig::default());
    ChatService::new(
        p.store.clone(),
        p.repository.clone(),
        model,
        Some(p.producer.clone()),
        context,
    )
}

async fn run_until(consumer: Arc<EventConsumer>, done: impl Fn(&ConsumerStats) -> bool) -> ConsumerStats {
    let cancel = CancellationToken::new();
    let handle = consumer.clone().spawn(cancel.clone());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !done(&consumer.stats()) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    handle.await.unwrap();
    consumer.stats()
}

async fn dead_letters(broker: &SqliteBroker) -> Vec<Record> {
    let reader = broker
        .reader(DLQ_TOPIC, "dlq-inspector", (0..PARTITIONS).collect(), StartOffset::Earliest)
        .await
        .unwrap();
    let mut out = Vec::new();
    while let Some(fetched) = reader.fetch(Duration::from_millis(50)).await.unwrap() {
        out.push(fetched.record);
    }
    out
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_message_is_served_from_cache_then_persisted_by_consumer() {
    let p = pipeline(memory_pool().await).await;
    let model = Arc::new(ScriptedModel::new("Ownership means one owner."));
    let chat = service(&p, model);
    let session = chat.create_session(7).await.unwrap();

    let reply = chat
        .send_message(session.id, "Explain ownership", |_| {}, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply.content, "Ownership means one owner.");

    // Readable immediately, before anything is durable.
    assert_eq!(p.store.count_by_session(session.id).await.unwrap(), 0);
    let history = chat.get_messages(session.id).await.unwrap();
    assert_eq!(history.len(), 2);

    let consumer = persistence_consumer(&p, p.store.clone(), consumer_config()).await;
    let stats = run_until(consumer, |s| s.committed >= 2).await;
    assert_eq!(stats.committed, 2);
    assert_eq!(stats.dead_lettered, 0);

    let durable = p.store.find_by_session(session.id).await.unwrap();
    assert_eq!(durable.len(), 2);
    assert_eq!(durable[0].role, Role::User);
    assert_eq!(durable[0].content, "Explain ownership");
    assert_eq!(durable[1].role, Role::Assistant);

    let named = p.store.find_by_id(session.id).await.unwrap().unwrap();
    assert_eq!(named.title, "Explain ownership");
}

#[tokio::test]
async fn e2e_long_session_is_summarized_once_over_the_oldest_messages() {
    let p = pipeline(memory_pool().await).await;
    for i in 0..25 {
        let mut m = if i % 2 == 0 {
            Message::user(1, format!("question {i}"))
        } else {
            Message::assistant(1, format!("answer {i}"))
        };
        m.created_at = chrono::DateTime::from_timestamp_millis(1_700_000_000_000 + i).unwrap();
        p.store.insert(&m).await.unwrap();
    }

    let model = Arc::new(ScriptedModel::new("ok"));
    let assembler = ContextAssembler::new(p.repository.clone(), model.clone(), ContextConfig::default());
    let turns = assembler.build_context(1, "what did we cover?").await;

    assert_eq!(turns.len(), 23);
    assert_eq!(turns[0].role, Role::System);
    assert_eq!(turns[1].content, "Conversation summary: the user asked many questions");
    assert_eq!(turns[2].content, "answer 5");
    assert_eq!(turns[22].content, "what did we cover?");

    let summarized = model.summarized.lock().unwrap();
    assert_eq!(summarized.len(), 1);
    assert_eq!(summarized[0].len(), 5);
    assert_eq!(summarized[0][0].content, "question 0");
    assert_eq!(summarized[0][4].content, "question 4");
}

#[tokio::test]
async fn e2e_cold_cache_is_warmed_from_durable_store() {
    let store = Arc::new(InMemoryStore::new());
    for content in ["one", "two", "three"] {
        store.insert(&Message::user(3, content)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let cache = Arc::new(MessageCache::new(
        Arc::new(InMemoryListStore::new()),
        &CacheConfig::default(),
    ));
    let repository = MessageRepository::new(store.clone(), cache.clone());

    let first = repository.find_by_session(3).await.unwrap();
    assert_eq!(first.len(), 3);
    repository.wait_for_warmups().await;
    assert_eq!(cache.count(3).await.unwrap(), 3);

    store.set_offline(true);
    let second = repository.find_by_session(3).await.unwrap();
    let contents: Vec<&str> = second.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["one", "two", "three"]);
}

#[tokio::test]
async fn e2e_poison_record_is_dead_lettered_without_blocking_the_session() {
    let p = pipeline(memory_pool().await).await;
    let good = Envelope::from(&Message::user(5, "before"));
    let after = Envelope::from(&Message::user(5, "after"));

    p.producer.send(&good).await.unwrap();
    p.broker
        .publish(TOPIC, vec![Record::new("5", b"{not json".to_vec())], &PublishOptions::default())
        .await
        .unwrap();
    p.producer.send(&after).await.unwrap();

    let consumer = persistence_consumer(&p, p.store.clone(), consumer_config()).await;
    let stats = run_until(consumer, |s| s.committed + s.dead_lettered >= 3).await;
    assert_eq!(stats.parse_failures, 1);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.committed, 2);

    let durable = p.store.find_by_session(5).await.unwrap();
    let contents: Vec<&str> = durable.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["before", "after"]);

    let dlq = dead_letters(&p.broker).await;
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].value, b"{not json".to_vec());
    assert!(!dlq[0].header(DLQ_ERROR_HEADER).unwrap().is_empty());
    assert_eq!(dlq[0].header(DLQ_SOURCE_OFFSET_HEADER), Some("1"));
}

#[tokio::test]
async fn e2e_failing_store_retries_then_dead_letters() {
    let p = pipeline(memory_pool().await).await;
    let flaky = Arc::new(InMemoryStore::new());
    flaky.fail_next_inserts(3);

    p.producer.send(&Envelope::from(&Message::user(8, "doomed"))).await.unwrap();
    p.producer.send(&Envelope::from(&Message::user(8, "fine"))).await.unwrap();

    let consumer = persistence_consumer(&p, flaky.clone(), consumer_config()).await;
    let stats = run_until(consumer, |s| s.committed + s.dead_lettered >= 2).await;
    assert_eq!(stats.handler_failures, 3);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.committed, 1);

    let stored = flaky.find_by_session(8).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "fine");

    let dlq = dead_letters(&p.broker).await;
    let dead = Envelope::decode(&dlq[0].value).unwrap();
    assert_eq!(dead.content, "doomed");
}

#[tokio::test]
async fn e2e_redelivery_after_restart_persists_once() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("chatline.sqlite").display());

    let pool = chatline_storage::connect(&url, 4).await.unwrap();
    let p = pipeline(pool).await;
    let envelope = Envelope::from(&Message::user(11, "exactly once please"));
    p.producer.send(&envelope).await.unwrap();

    // Persisted, but the consumer stops before its commit lands.
    PersistenceHandler::new(p.store.clone())
        .handle(&envelope)
        .await
        .unwrap();

    // A fresh process with the same group re-reads the uncommitted record.
    let consumer = persistence_consumer(&p, p.store.clone(), consumer_config()).await;
    let stats = run_until(consumer, |s| s.committed >= 1).await;
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.handler_failures, 0);
    assert_eq!(p.store.count_by_session(11).await.unwrap(), 1);
}

#[tokio::test]
async fn e2e_producer_and_consumer_in_separate_connections() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("shared.sqlite").display());

    let chat_side = pipeline(chatline_storage::connect(&url, 2).await.unwrap()).await;
    let consume_side = pipeline(chatline_storage::connect(&url, 2).await.unwrap()).await;

    let model = Arc::new(ScriptedModel::new("pong"));
    let chat = service(&chat_side, model);
    let session = chat.create_session(1).await.unwrap();
    chat.send_message(session.id, "ping", |_| {}, &CancellationToken::new())
        .await
        .unwrap();

    let consumer = persistence_consumer(&consume_side, consume_side.store.clone(), consumer_config()).await;
    let stats = run_until(consumer, |s| s.committed >= 2).await;
    assert_eq!(stats.committed, 2);

    let durable = chat_side.store.find_by_session(session.id).await.unwrap();
    assert_eq!(durable.len(), 2);
    assert_eq!(durable[1].content, "pong");
}
