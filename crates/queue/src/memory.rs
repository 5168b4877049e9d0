//! In-process partitioned log — for tests and single-process deployments.
//!
//! Each topic is a fixed set of append-only partitions; a record's offset is
//! its index in the partition. Committed offsets are kept per
//! (group, topic, partition), so a new reader of a group resumes after the
//! last committed record and anything fetched but uncommitted is redelivered.

use async_trait::async_trait;
use chatline_core::error::QueueError;
use chatline_core::queue::{
    FetchedRecord, PartitionReader, PublishOptions, Record, RecordSink, StartOffset,
    partition_for_key,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

#[derive(Default)]
struct BrokerState {
    /// topic -> partitions -> records
    topics: HashMap<String, Vec<Vec<Record>>>,
    /// (group, topic, partition) -> next offset to read
    committed: HashMap<(String, String, u32), u64>,
}

impl BrokerState {
    fn partitions_mut(&mut self, topic: &str, count: u32) -> &mut Vec<Vec<Record>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); count as usize])
    }

    fn partition_len(&self, topic: &str, partition: u32) -> u64 {
        self.topics
            .get(topic)
            .and_then(|p| p.get(partition as usize))
            .map_or(0, |p| p.len() as u64)
    }
}

/// An in-process broker. Cloning shares the same log.
#[derive(Clone)]
pub struct InMemoryBroker {
    partitions: u32,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    failing_publishes: Arc<AtomicU32>,
    failing_commits: Arc<AtomicU32>,
}

impl InMemoryBroker {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Arc::new(Mutex::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
            failing_publishes: Arc::new(AtomicU32::new(0)),
            failing_commits: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions
    }

    /// Attach a consumer-group member to `topic`.
    pub async fn reader(
        &self,
        topic: &str,
        group_id: &str,
        assignment: Vec<u32>,
        start: StartOffset,
    ) -> InMemoryReader {
        let state = self.state.lock().await;
        let positions = assignment
            .iter()
            .map(|&p| {
                let key = (group_id.to_string(), topic.to_string(), p);
                let pos = match state.committed.get(&key) {
                    Some(&committed) => committed,
                    None => match start {
                        StartOffset::Earliest => 0,
                        StartOffset::Latest => state.partition_len(topic, p),
                    },
                };
                (p, pos)
            })
            .collect();

        InMemoryReader {
            broker: self.clone(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            assignment,
            cursor: Mutex::new(ReadCursor {
                positions,
                next_slot: 0,
            }),
        }
    }

    /// Every record on `topic`, partition by partition.
    pub async fn records(&self, topic: &str) -> Vec<FetchedRecord> {
        let state = self.state.lock().await;
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(p, records)| {
                records.iter().enumerate().map(move |(offset, record)| FetchedRecord {
                    topic: topic.to_string(),
                    partition: p as u32,
                    offset: offset as u64,
                    record: record.clone(),
                })
            })
            .collect()
    }

    /// Next offset `group_id` will read on a partition, if it ever committed.
    pub async fn committed_offset(&self, group_id: &str, topic: &str, partition: u32) -> Option<u64> {
        let key = (group_id.to_string(), topic.to_string(), partition);
        self.state.lock().await.committed.get(&key).copied()
    }

    /// Make the next `n` publishes fail with a transport error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` commits fail.
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RecordSink for InMemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(
        &self,
        topic: &str,
        records: Vec<Record>,
        options: &PublishOptions,
    ) -> Result<(), QueueError> {
        if Self::take_failure(&self.failing_publishes) {
            return Err(QueueError::Transport("injected publish failure".into()));
        }

        let count = records.len();
        {
            let mut state = self.state.lock().await;
            let partitions = state.partitions_mut(topic, self.partitions);
            for record in records {
                let p = partition_for_key(&record.key, self.partitions);
                partitions[p as usize].push(record);
            }
        }
        self.notify.notify_waiters();
        debug!(topic, count, compression = %options.compression, "Published records");
        Ok(())
    }
}

struct ReadCursor {
    /// partition -> next offset to hand out
    positions: HashMap<u32, u64>,
    /// round-robin start slot into the assignment
    next_slot: usize,
}

/// One consumer-group member reading from an [`InMemoryBroker`].
pub struct InMemoryReader {
    broker: InMemoryBroker,
    topic: String,
    group_id: String,
    assignment: Vec<u32>,
    cursor: Mutex<ReadCursor>,
}

impl InMemoryReader {
    async fn try_next(&self) -> Option<FetchedRecord> {
        if self.assignment.is_empty() {
            return None;
        }
        let state = self.broker.state.lock().await;
        let mut cursor = self.cursor.lock().await;
        let partitions = state.topics.get(&self.topic)?;

        for i in 0..self.assignment.len() {
            let slot = (cursor.next_slot + i) % self.assignment.len();
            let p = self.assignment[slot];
            let pos = cursor.positions.get(&p).copied().unwrap_or(0);
            if let Some(record) = partitions.get(p as usize).and_then(|r| r.get(pos as usize)) {
                let fetched = FetchedRecord {
                    topic: self.topic.clone(),
                    partition: p,
                    offset: pos,
                    record: record.clone(),
                };
                cursor.positions.insert(p, pos + 1);
                cursor.next_slot = (slot + 1) % self.assignment.len();
                return Some(fetched);
            }
        }
        None
    }
}

#[async_trait]
impl PartitionReader for InMemoryReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn assignment(&self) -> &[u32] {
        &self.assignment
    }

    async fn fetch(&self, max_wait: Duration) -> Result<Option<FetchedRecord>, QueueError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(record) = self.try_next().await {
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&self, record: &FetchedRecord) -> Result<(), QueueError> {
        if InMemoryBroker::take_failure(&self.broker.failing_commits) {
            return Err(QueueError::Commit("injected commit failure".into()));
        }
        let key = (self.group_id.clone(), record.topic.clone(), record.partition);
        let mut state = self.broker.state.lock().await;
        let next = state.committed.entry(key).or_insert(0);
        *next = (*next).max(record.offset + 1);
        Ok(())
    }
}
