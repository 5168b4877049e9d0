//! List store trait — the key-value/list capability behind the message cache.
//!
//! Mirrors the handful of list primitives a Redis-like store offers. The
//! one composite operation, [`ListStore::push_trim_expire`], must be applied
//! by the backend as a single atomic unit: callers never compose it from
//! separate calls.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::CacheError;

/// The list-store capability.
///
/// Implementations: in-process map, SQLite table.
/// A key whose TTL has lapsed behaves exactly like an absent key.
#[async_trait]
pub trait ListStore: Send + Sync {
    /// The backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Atomically append `values` to the tail of `key`, reset its TTL, and
    /// trim from the head so at most `max_len` values remain (`0` = unbounded).
    async fn push_trim_expire(
        &self,
        key: &str,
        values: Vec<String>,
        max_len: usize,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Values between `start` and `stop`, both inclusive. Negative indexes
    /// count from the tail (`-1` is the last element). Out-of-range bounds are
    /// clamped; an absent key yields an empty list.
    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, CacheError>;

    /// Number of values under `key` (0 if absent).
    async fn len(&self, key: &str) -> Result<usize, CacheError>;

    /// Whether `key` currently exists.
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Reset the TTL of `key` without touching its values. Returns `false`
    /// when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;
}

/// Resolve redis-style inclusive `start..=stop` indexes against a list of
/// `len` elements. Returns `None` when the window is empty.
pub fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}
