//! Process wiring: builds the pipeline's components from configuration.

use chatline_cache::{InMemoryListStore, MessageCache, SqliteListStore};
use chatline_chat::{ChatService, ContextAssembler};
use chatline_config::{AppConfig, Backend};
use chatline_core::ChatModel;
use chatline_core::cache::ListStore;
use chatline_core::queue::{PartitionReader, RecordSink, assign_partitions};
use chatline_queue::{EventConsumer, EventProducer, InMemoryBroker, SqliteBroker};
use chatline_storage::{MessageRepository, PersistenceHandler, SqliteStore};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

enum Transport {
    Memory(InMemoryBroker),
    Sqlite(Arc<SqliteBroker>),
}

pub struct Runtime {
    pub config: AppConfig,
    pub store: Arc<SqliteStore>,
    pub repository: Arc<MessageRepository>,
    pub producer: Arc<EventProducer>,
    transport: Transport,
}

impl Runtime {
    pub async fn build(config: AppConfig) -> Result<Self, Box<dyn Error>> {
        let pool = chatline_storage::connect(&config.database.url, config.database.max_connections).await?;
        let store = Arc::new(SqliteStore::from_pool(pool.clone()).await?);

        let list_store: Arc<dyn ListStore> = match config.cache.backend {
            Backend::Memory => Arc::new(InMemoryListStore::new()),
            Backend::Sqlite => Arc::new(SqliteListStore::from_pool(pool.clone()).await?),
        };
        let cache = Arc::new(MessageCache::new(list_store, &config.cache));
        let repository = Arc::new(MessageRepository::new(store.clone(), cache));

        let transport = match config.queue.backend {
            Backend::Memory => Transport::Memory(InMemoryBroker::new(config.queue.partitions)),
            Backend::Sqlite => Transport::Sqlite(Arc::new(
                SqliteBroker::from_pool(pool, config.queue.partitions).await?,
            )),
        };
        let sink: Arc<dyn RecordSink> = match &transport {
            Transport::Memory(broker) => Arc::new(broker.clone()),
            Transport::Sqlite(broker) => broker.clone(),
        };
        let producer = Arc::new(EventProducer::new(sink, config.queue.topic.clone(), &config.queue.producer));

        info!(
            database = %config.database.url,
            cache = backend_name(config.cache.backend),
            queue = backend_name(config.queue.backend),
            "Runtime ready"
        );

        Ok(Self {
            config,
            store,
            repository,
            producer,
            transport,
        })
    }

    /// Whether the queue lives in this process, so the consumer must too.
    pub fn in_process_queue(&self) -> bool {
        matches!(self.transport, Transport::Memory(_))
    }

    /// A persistence consumer for this process's share of the partitions.
    pub async fn consumer(&self) -> Result<EventConsumer, Box<dyn Error>> {
        let queue = &self.config.queue;
        let consumer_config = &queue.consumer;
        let assignment = assign_partitions(queue.partitions, consumer_config.member_index, consumer_config.members);

        let (reader, dlq): (Arc<dyn PartitionReader>, Arc<dyn RecordSink>) = match &self.transport {
            Transport::Memory(broker) => (
                Arc::new(
                    broker
                        .reader(&queue.topic, &consumer_config.group_id, assignment, consumer_config.start_offset)
                        .await,
                ),
                Arc::new(broker.clone()),
            ),
            Transport::Sqlite(broker) => (
                Arc::new(
                    broker
                        .reader(&queue.topic, &consumer_config.group_id, assignment, consumer_config.start_offset)
                        .await?,
                ),
                broker.clone(),
            ),
        };

        let mut consumer = EventConsumer::new(reader, dlq, queue.dlq_topic.clone(), consumer_config.clone());
        consumer.register_handler(Arc::new(PersistenceHandler::new(self.store.clone())));
        Ok(consumer)
    }

    pub fn chat_service(&self, model: Arc<dyn ChatModel>) -> ChatService {
        let context = ContextAssembler::new(self.repository.clone(), model.clone(), self.config.context.clone());
        ChatService::new(
            self.store.clone(),
            self.repository.clone(),
            model,
            Some(self.producer.clone()),
            context,
        )
    }

    /// Wait until the in-process consumer has committed everything published
    /// so far, or `timeout` passes.
    pub async fn drain_in_process(&self, timeout: Duration) {
        let Transport::Memory(broker) = &self.transport else {
            return;
        };
        let topic = &self.config.queue.topic;
        let group = &self.config.queue.consumer.group_id;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let mut pending = 0;
            for record in broker.records(topic).await {
                let committed = broker.committed_offset(group, topic, record.partition).await;
                if committed.is_none_or(|next| next <= record.offset) {
                    pending += 1;
                }
            }
            if pending == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(pending, "Shutting down with unpersisted messages");
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Flush the producer, stop warm-ups and close the database.
    pub async fn shutdown(&self) {
        self.producer.close().await;
        self.repository.shutdown().await;
        self.store.pool().close().await;
    }
}

fn backend_name(backend: Backend) -> &'static str {
    match backend {
        Backend::Memory => "memory",
        Backend::Sqlite => "sqlite",
    }
}
