//! Event rows: blink events and performance samples.
//!
//! The `New*` types are what producers hand to the ingestion queue; the
//! stored types add the row id, the owning session and the sync flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewBlink {
    pub timestamp: DateTime<Utc>,
    /// Blinks observed since the previous event.
    pub blink_count: u32,
    /// Blinks per minute at the time of the event.
    pub blink_rate: f64,
    pub eye_aspect_ratio: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlinkEvent {
    pub id: i64,
    pub session_id: i64,
    pub timestamp: DateTime<Utc>,
    pub blink_count: u32,
    pub blink_rate: f64,
    pub eye_aspect_ratio: Option<f64>,
    pub is_synced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewPerformanceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub battery_level: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    pub id: i64,
    pub session_id: i64,
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub battery_level: Option<u8>,
}
