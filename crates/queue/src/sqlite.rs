//! SQLite-backed partitioned log.
//!
//! Lets the `chat` process publish and a separate `consume` process read the
//! same topic through a shared database file. Tables:
//! - `queue_records` — records keyed by (topic, partition, offset)
//! - `queue_offsets` — next offset per (group, topic, partition)
//!
//! Readers poll; there is no cross-process wakeup.

use async_trait::async_trait;
use chatline_core::error::QueueError;
use chatline_core::queue::{
    FetchedRecord, PartitionReader, PublishOptions, Record, RecordSink, StartOffset,
    partition_for_key,
};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn transport(what: &str, e: impl std::fmt::Display) -> QueueError {
    QueueError::Transport(format!("{what}: {e}"))
}

/// A durable broker sharing the application's SQLite pool.
#[derive(Clone)]
pub struct SqliteBroker {
    pool: SqlitePool,
    partitions: u32,
}

impl SqliteBroker {
    /// Wrap an existing pool and create the queue tables if needed.
    pub async fn from_pool(pool: SqlitePool, partitions: u32) -> Result<Self, QueueError> {
        let broker = Self {
            pool,
            partitions: partitions.max(1),
        };
        broker.run_migrations().await?;
        Ok(broker)
    }

    async fn run_migrations(&self) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_records (
                topic        TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                record_offset INTEGER NOT NULL,
                key          TEXT NOT NULL,
                value        BLOB NOT NULL,
                headers      TEXT NOT NULL DEFAULT '[]',
                compression  TEXT NOT NULL,
                published_at INTEGER NOT NULL,
                PRIMARY KEY (topic, partition_id, record_offset)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| transport("queue_records table", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_offsets (
                group_id     TEXT NOT NULL,
                topic        TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                next_offset  INTEGER NOT NULL,
                PRIMARY KEY (group_id, topic, partition_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| transport("queue_offsets table", e))?;

        debug!("SQLite queue migrations complete");
        Ok(())
    }

    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64, QueueError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(record_offset) + 1, 0) AS next FROM queue_records WHERE topic = ?1 AND partition_id = ?2",
        )
        .bind(topic)
        .bind(partition as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| transport("end offset", e))?;
        let next: i64 = row.try_get("next").map_err(|e| transport("next column", e))?;
        Ok(next as u64)
    }

    /// Attach a consumer-group member to `topic`.
    pub async fn reader(
        &self,
        topic: &str,
        group_id: &str,
        assignment: Vec<u32>,
        start: StartOffset,
    ) -> Result<SqliteReader, QueueError> {
        let mut positions = HashMap::new();
        for &p in &assignment {
            let committed = sqlx::query(
                "SELECT next_offset FROM queue_offsets WHERE group_id = ?1 AND topic = ?2 AND partition_id = ?3",
            )
            .bind(group_id)
            .bind(topic)
            .bind(p as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| transport("committed offset", e))?;

            let pos = match committed {
                Some(row) => {
                    let next: i64 = row
                        .try_get("next_offset")
                        .map_err(|e| transport("next_offset column", e))?;
                    next as u64
                }
                None => match start {
                    StartOffset::Earliest => 0,
                    StartOffset::Latest => self.end_offset(topic, p).await?,
                },
            };
            positions.insert(p, pos);
        }

        Ok(SqliteReader {
            broker: self.clone(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            assignment,
            cursor: Mutex::new((positions, 0)),
        })
    }
}

#[async_trait]
impl RecordSink for SqliteBroker {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn publish(
        &self,
        topic: &str,
        records: Vec<Record>,
        options: &PublishOptions,
    ) -> Result<(), QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| transport("begin", e))?;
        let published_at = Utc::now().timestamp_millis();

        for record in &records {
            let partition = partition_for_key(&record.key, self.partitions);
            let headers = serde_json::to_string(&record.headers)
                .map_err(|e| transport("headers encoding", e))?;
            sqlx::query(
                r#"
                INSERT INTO queue_records
                    (topic, partition_id, record_offset, key, value, headers, compression, published_at)
                VALUES (
                    ?1, ?2,
                    (SELECT COALESCE(MAX(record_offset) + 1, 0) FROM queue_records WHERE topic = ?1 AND partition_id = ?2),
                    ?3, ?4, ?5, ?6, ?7
                )
                "#,
            )
            .bind(topic)
            .bind(partition as i64)
            .bind(&record.key)
            .bind(&record.value)
            .bind(&headers)
            .bind(options.compression.as_str())
            .bind(published_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| transport("INSERT record", e))?;
        }

        tx.commit().await.map_err(|e| transport("commit", e))?;
        debug!(topic, count = records.len(), "Published records");
        Ok(())
    }
}

/// One consumer-group member polling a [`SqliteBroker`].
pub struct SqliteReader {
    broker: SqliteBroker,
    topic: String,
    group_id: String,
    assignment: Vec<u32>,
    /// (partition -> next offset, round-robin slot)
    cursor: Mutex<(HashMap<u32, u64>, usize)>,
}

impl SqliteReader {
    async fn try_next(&self) -> Result<Option<FetchedRecord>, QueueError> {
        if self.assignment.is_empty() {
            return Ok(None);
        }
        let mut cursor = self.cursor.lock().await;
        let (positions, next_slot) = &mut *cursor;

        for i in 0..self.assignment.len() {
            let slot = (*next_slot + i) % self.assignment.len();
            let p = self.assignment[slot];
            let pos = positions.get(&p).copied().unwrap_or(0);

            let row = sqlx::query(
                r#"
                SELECT record_offset, key, value, headers FROM queue_records
                WHERE topic = ?1 AND partition_id = ?2 AND record_offset >= ?3
                ORDER BY record_offset ASC LIMIT 1
                "#,
            )
            .bind(&self.topic)
            .bind(p as i64)
            .bind(pos as i64)
            .fetch_optional(&self.broker.pool)
            .await
            .map_err(|e| transport("fetch", e))?;

            if let Some(row) = row {
                let offset: i64 = row.try_get("record_offset").map_err(|e| transport("record_offset column", e))?;
                let key: String = row.try_get("key").map_err(|e| transport("key column", e))?;
                let value: Vec<u8> = row.try_get("value").map_err(|e| transport("value column", e))?;
                let headers_json: String = row
                    .try_get("headers")
                    .map_err(|e| transport("headers column", e))?;
                // Unreadable headers must not stall the partition; the payload
                // still goes to the handlers.
                let headers: Vec<(String, String)> = match serde_json::from_str(&headers_json) {
                    Ok(headers) => headers,
                    Err(e) => {
                        warn!(
                            topic = %self.topic,
                            partition = p,
                            offset,
                            error = %e,
                            "Dropping unreadable record headers"
                        );
                        Vec::new()
                    }
                };

                positions.insert(p, offset as u64 + 1);
                *next_slot = (slot + 1) % self.assignment.len();
                return Ok(Some(FetchedRecord {
                    topic: self.topic.clone(),
                    partition: p,
                    offset: offset as u64,
                    record: Record { key, value, headers },
                }));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl PartitionReader for SqliteReader {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn assignment(&self) -> &[u32] {
        &self.assignment
    }

    async fn fetch(&self, max_wait: Duration) -> Result<Option<FetchedRecord>, QueueError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(record) = self.try_next().await? {
                return Ok(Some(record));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn commit(&self, record: &FetchedRecord) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO queue_offsets (group_id, topic, partition_id, next_offset)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(group_id, topic, partition_id) DO UPDATE SET
                next_offset = MAX(next_offset, excluded.next_offset)
            "#,
        )
        .bind(&self.group_id)
        .bind(&record.topic)
        .bind(record.partition as i64)
        .bind(record.offset as i64 + 1)
        .execute(&self.broker.pool)
        .await
        .map_err(|e| QueueError::Commit(e.to_string()))?;
        Ok(())
    }
}
