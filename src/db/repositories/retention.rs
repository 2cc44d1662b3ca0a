use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::helpers::format_datetime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub deleted_sessions: usize,
    pub deleted_sync_intents: usize,
}

impl RetentionReport {
    pub fn is_empty(&self) -> bool {
        self.deleted_sessions == 0 && self.deleted_sync_intents == 0
    }
}

pub fn cutoff_for(days_to_keep: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(i64::from(days_to_keep))
}

/// Deletes sessions that ended before `cutoff` and orphaned open sessions
/// that started before it (never `current_session`). Event rows go with them
/// through `ON DELETE CASCADE`. Consumed sync intents older than `cutoff` are
/// dropped as well; unconsumed ones are kept for the sync agent.
pub fn delete_expired(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    current_session: Option<i64>,
) -> Result<RetentionReport> {
    let cutoff = format_datetime(&cutoff);

    let deleted_sessions = conn.execute(
        "DELETE FROM sessions
         WHERE (end_time IS NOT NULL AND end_time < ?1)
            OR (end_time IS NULL AND start_time < ?1 AND id IS NOT ?2)",
        params![cutoff, current_session],
    )?;

    let deleted_sync_intents = conn.execute(
        "DELETE FROM sync_intents
         WHERE consumed_at IS NOT NULL AND created_at < ?1",
        params![cutoff],
    )?;

    Ok(RetentionReport {
        deleted_sessions,
        deleted_sync_intents,
    })
}
