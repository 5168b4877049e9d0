//! Queue transport traits — partitioned, ordered-per-key record transit.
//!
//! The queue owns no state of record: it only carries envelopes from the
//! write path to the consumer. Two capabilities are defined here:
//!
//! - [`RecordSink`]: publish keyed records to a topic
//! - [`PartitionReader`]: pull records from an assigned set of partitions in
//!   order and commit offsets manually
//!
//! plus [`EnvelopeHandler`], the unit of work a consumer dispatches to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{HandlerError, QueueError};
use crate::message::Envelope;

/// Header carrying the failure reason on dead-lettered records.
pub const DLQ_ERROR_HEADER: &str = "dlq_error";
/// Header carrying the topic a dead-lettered record was read from.
pub const DLQ_SOURCE_TOPIC_HEADER: &str = "dlq_source_topic";
/// Header carrying the partition a dead-lettered record was read from.
pub const DLQ_SOURCE_PARTITION_HEADER: &str = "dlq_source_partition";
/// Header carrying the offset a dead-lettered record was read from.
pub const DLQ_SOURCE_OFFSET_HEADER: &str = "dlq_source_offset";

/// One keyed record on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Partitioning key. Records sharing a key share a partition.
    pub key: String,
    /// Raw payload bytes.
    pub value: Vec<u8>,
    /// Ordered header list.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl Record {
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            headers: Vec::new(),
        }
    }

    /// Encode an envelope keyed by its session.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self::new(envelope.partition_key(), envelope.encode())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header value named `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A record as read back from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub record: Record,
}

/// Acknowledgement level requested from the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Do not wait for any acknowledgement.
    None,
    /// Wait for the partition leader.
    Leader,
    /// Wait for every in-sync replica.
    #[default]
    All,
}

impl FromStr for Acks {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "require_none" | "0" => Ok(Self::None),
            "leader" | "one" | "require_one" | "1" => Ok(Self::Leader),
            "all" | "require_all" | "-1" => Ok(Self::All),
            other => Err(format!("unknown acks level '{other}'")),
        }
    }
}

/// Payload compression codec requested from the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    #[default]
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "snappy" => Ok(Self::Snappy),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            other => Err(format!("unknown compression codec '{other}'")),
        }
    }
}

/// Per-publish options handed to the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub acks: Acks,
    pub compression: Compression,
}

/// Where a consumer group starts on a partition it has never committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    /// From the first retained record.
    Earliest,
    /// Only records published after the consumer joined.
    #[default]
    Latest,
}

impl FromStr for StartOffset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" | "first" => Ok(Self::Earliest),
            "latest" | "last" => Ok(Self::Latest),
            other => Err(format!("unknown start offset '{other}'")),
        }
    }
}

/// Stable partition for `key`: FNV-1a hash modulo `partitions`.
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    if partitions <= 1 {
        return 0;
    }
    let hash = key.bytes().fold(FNV_OFFSET, |acc, b| {
        (acc ^ u32::from(b)).wrapping_mul(FNV_PRIME)
    });
    hash % partitions
}

/// Partitions owned by member `member_index` of a group of `members`
/// consumers, assigned round-robin.
pub fn assign_partitions(partitions: u32, member_index: u32, members: u32) -> Vec<u32> {
    let members = members.max(1);
    (0..partitions)
        .filter(|p| p % members == member_index % members)
        .collect()
}

/// Publishing capability.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// The backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Append `records` to `topic`. All records are appended or none are.
    async fn publish(
        &self,
        topic: &str,
        records: Vec<Record>,
        options: &PublishOptions,
    ) -> Result<(), QueueError>;
}

/// Pulling capability for one consumer-group member.
///
/// Records of a partition are returned in offset order. A fetched but
/// uncommitted record is redelivered to the next reader of the group.
#[async_trait]
pub trait PartitionReader: Send + Sync {
    /// Topic this reader is attached to.
    fn topic(&self) -> &str;

    /// Partitions assigned to this reader.
    fn assignment(&self) -> &[u32];

    /// Next record, waiting at most `max_wait`. `Ok(None)` when nothing arrived.
    async fn fetch(&self, max_wait: Duration) -> Result<Option<FetchedRecord>, QueueError>;

    /// Advance the group's committed offset past `record`.
    async fn commit(&self, record: &FetchedRecord) -> Result<(), QueueError>;
}

/// A unit of work the consumer dispatches each parsed envelope to.
///
/// Handlers must be idempotent: delivery is at-least-once.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}
