use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters shared by producers and the writer. Relaxed ordering is enough:
/// they are only ever read as a snapshot.
#[derive(Debug, Default)]
pub struct IngestCounters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    committed: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    overflowed: AtomicU64,
    overflow_lost: AtomicU64,
    replayed: AtomicU64,
}

impl IngestCounters {
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the running total of drops, including this one.
    pub fn record_dropped(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_flush(&self, records: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.committed.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_failed_flush(&self) {
        self.failed_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflowed(&self, records: usize) {
        self.overflowed.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_overflow_lost(&self, records: usize) {
        self.overflow_lost.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_replayed(&self, records: usize) {
        self.replayed.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestStats {
        IngestStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
            overflow_lost: self.overflow_lost.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub committed: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
    /// Records parked in the overflow log after exhausting retries.
    pub overflowed: u64,
    /// Records that could not even be parked.
    pub overflow_lost: u64,
    /// Overflow records committed on a later start.
    pub replayed: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FaultKind {
    /// A batch exhausted its retries and was parked in the overflow log.
    TransactionFailure,
    /// A batch exhausted its retries and the overflow log rejected it too.
    OverflowFailure,
    /// The database could not be opened; the writer is degraded.
    StorageUnavailable,
    /// Parked records could not be replayed at startup; they stay parked.
    ReplayFailure,
}

/// Asynchronous report of a writer-side failure nobody was waiting on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WriterFault {
    pub kind: FaultKind,
    pub records: usize,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl WriterFault {
    pub fn new(kind: FaultKind, records: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            records,
            message: message.into(),
            at: Utc::now(),
        }
    }
}
