//! Consumer throughput and error counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time snapshot of a consumer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub fetched: u64,
    pub committed: u64,
    pub dead_lettered: u64,
    pub handler_failures: u64,
    pub parse_failures: u64,
    pub commit_failures: u64,
    pub fetch_errors: u64,
    pub dlq_failures: u64,
}

impl fmt::Display for ConsumerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched={} committed={} dead_lettered={} handler_failures={} parse_failures={} commit_failures={} fetch_errors={} dlq_failures={}",
            self.fetched,
            self.committed,
            self.dead_lettered,
            self.handler_failures,
            self.parse_failures,
            self.commit_failures,
            self.fetch_errors,
            self.dlq_failures,
        )
    }
}

#[derive(Default)]
pub(crate) struct StatsRecorder {
    pub fetched: AtomicU64,
    pub committed: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub handler_failures: AtomicU64,
    pub parse_failures: AtomicU64,
    pub commit_failures: AtomicU64,
    pub fetch_errors: AtomicU64,
    pub dlq_failures: AtomicU64,
}

impl StatsRecorder {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            fetched: self.fetched.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            dlq_failures: self.dlq_failures.load(Ordering::Relaxed),
        }
    }
}
