//! Bounded, non-blocking hand-off between producers and the batch writer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::db::models::{NewBlink, NewPerformanceSample};
use crate::error::{Result, StoreError};
use crate::ingest::stats::{IngestCounters, IngestStats};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// One warning per this many dropped records.
const DROP_LOG_EVERY: u64 = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventRecord {
    Blink(NewBlink),
    Performance(NewPerformanceSample),
}

impl EventRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EventRecord::Blink(blink) => blink.timestamp,
            EventRecord::Performance(sample) => sample.timestamp,
        }
    }
}

pub type RecordReceiver = mpsc::Receiver<EventRecord>;

/// Producer handle. Cheap to clone; every clone feeds the same writer.
#[derive(Clone)]
pub struct IngestQueue {
    sender: mpsc::Sender<EventRecord>,
    capacity: usize,
    counters: Arc<IngestCounters>,
}

pub fn ingest_channel(capacity: usize, counters: Arc<IngestCounters>) -> (IngestQueue, RecordReceiver) {
    let (sender, receiver) = mpsc::channel(capacity);
    (
        IngestQueue {
            sender,
            capacity,
            counters,
        },
        receiver,
    )
}

impl IngestQueue {
    /// Queues a record without waiting. Fails with `QueueFull` when every slot
    /// is taken and with `QueueClosed` once the writer has exited.
    pub fn enqueue(&self, record: EventRecord) -> Result<()> {
        match self.sender.try_send(record) {
            Ok(()) => {
                self.counters.record_enqueued();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(StoreError::QueueFull {
                capacity: self.capacity,
            }),
            Err(TrySendError::Closed(_)) => Err(StoreError::QueueClosed),
        }
    }

    /// Records a blink observation stamped with the current time. Never fails;
    /// a record that cannot be queued is counted as dropped.
    pub fn log_blink(&self, blink_count: u32, blink_rate: f64, eye_aspect_ratio: Option<f64>) {
        self.submit(EventRecord::Blink(NewBlink {
            timestamp: Utc::now(),
            blink_count,
            blink_rate,
            eye_aspect_ratio,
        }));
    }

    /// Same contract as [`IngestQueue::log_blink`].
    pub fn log_performance(&self, cpu_usage: f64, memory_usage: f64, battery_level: Option<u8>) {
        self.submit(EventRecord::Performance(NewPerformanceSample {
            timestamp: Utc::now(),
            cpu_usage,
            memory_usage,
            battery_level,
        }));
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records waiting for the writer.
    pub fn len(&self) -> usize {
        self.capacity.saturating_sub(self.sender.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> IngestStats {
        self.counters.snapshot()
    }

    fn submit(&self, record: EventRecord) {
        if let Err(err) = self.enqueue(record) {
            let dropped = self.counters.record_dropped();
            if dropped == 1 || dropped % DROP_LOG_EVERY == 0 {
                log_warn!("dropping event: {err} ({dropped} dropped so far)");
            }
        }
    }
}
