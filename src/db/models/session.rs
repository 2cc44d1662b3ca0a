//! Session-related data models.
//!
//! A session owns every blink event and performance sample recorded while it
//! was current. `end_time == None` marks the single open session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: i64,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_blinks: u64,
    pub max_blink_rate: f64,
    pub avg_blink_rate: f64,
    pub duration_secs: u64,
    pub is_synced: bool,
    pub cloud_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Summary of the blink events committed for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlinkSummary {
    pub event_count: u64,
    pub total_blinks: u64,
    pub avg_rate: Option<f64>,
    pub max_rate: Option<f64>,
    pub first_at: Option<DateTime<Utc>>,
    pub last_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub sample_count: u64,
    pub avg_cpu: Option<f64>,
    pub avg_memory: Option<f64>,
    pub avg_battery: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub session: Session,
    pub blinks: BlinkSummary,
    pub performance: PerformanceSummary,
    pub duration_minutes: f64,
}
