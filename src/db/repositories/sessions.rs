use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::config::UserIdentity;
use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, parse_optional_datetime, to_i64, to_u64},
    models::{BlinkSummary, PerformanceSummary, Session, SessionStats, SyncAction},
    repositories::sync_intents::record_intent,
};

pub const SESSIONS_TABLE: &str = "sessions";

const SESSION_COLUMNS: &str = "id, user_id, user_email, start_time, end_time, total_blinks, \
     max_blink_rate, avg_blink_rate, duration_secs, is_synced, cloud_session_id, created_at";

fn row_to_session(row: &Row) -> Result<Session> {
    let start_time: String = row.get("start_time")?;
    let end_time: Option<String> = row.get("end_time")?;
    let created_at: String = row.get("created_at")?;
    let total_blinks: i64 = row.get("total_blinks")?;
    let duration_secs: i64 = row.get("duration_secs")?;

    Ok(Session {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        user_email: row.get("user_email")?,
        start_time: parse_datetime(&start_time, "start_time")?,
        end_time: parse_optional_datetime(end_time, "end_time")?,
        total_blinks: to_u64(total_blinks, "total_blinks")?,
        max_blink_rate: row.get("max_blink_rate")?,
        avg_blink_rate: row.get("avg_blink_rate")?,
        duration_secs: to_u64(duration_secs, "duration_secs")?,
        is_synced: row.get("is_synced")?,
        cloud_session_id: row.get("cloud_session_id")?,
        created_at: parse_datetime(&created_at, "created_at")?,
    })
}

/// Creates an open session and its insert intent. Callers run this inside the
/// writer's transaction.
pub fn insert_session(
    conn: &Connection,
    started_at: DateTime<Utc>,
    user: Option<&UserIdentity>,
) -> Result<Session> {
    conn.execute(
        "INSERT INTO sessions (user_id, user_email, start_time, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            user.map(|u| u.id.as_str()),
            user.and_then(|u| u.email.as_deref()),
            format_datetime(&started_at),
            format_datetime(&started_at),
        ],
    )?;
    let id = conn.last_insert_rowid();

    let session = load_session(conn, id)?.ok_or_else(|| anyhow!("session {id} vanished"))?;
    record_intent(conn, SESSIONS_TABLE, id, SyncAction::Insert, &session)?;
    Ok(session)
}

pub fn load_session(conn: &Connection, session_id: i64) -> Result<Option<Session>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
    ))?;
    let mut rows = stmt.query(params![session_id])?;
    let session = match rows.next()? {
        Some(row) => Some(row_to_session(row)?),
        None => None,
    };
    Ok(session)
}

/// Sessions whose end timestamp is still null, newest first.
pub fn open_sessions(conn: &Connection) -> Result<Vec<Session>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions
         WHERE end_time IS NULL
         ORDER BY start_time DESC"
    ))?;
    let mut rows = stmt.query([])?;
    let mut sessions = Vec::new();
    while let Some(row) = rows.next()? {
        sessions.push(row_to_session(row)?);
    }
    Ok(sessions)
}

/// Newest sessions first, restricted to one user when `user_id` is given.
pub fn recent_sessions(
    conn: &Connection,
    limit: usize,
    user_id: Option<&str>,
) -> Result<Vec<Session>> {
    let limit = to_i64(limit as u64)?;
    let mut stmt;
    let mut rows = match user_id {
        Some(user_id) => {
            stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE user_id = ?1
                 ORDER BY start_time DESC, id DESC
                 LIMIT ?2"
            ))?;
            stmt.query(params![user_id, limit])?
        }
        None => {
            stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 ORDER BY start_time DESC, id DESC
                 LIMIT ?1"
            ))?;
            stmt.query(params![limit])?
        }
    };
    let mut sessions = Vec::new();
    while let Some(row) = rows.next()? {
        sessions.push(row_to_session(row)?);
    }
    Ok(sessions)
}

/// Timestamp of the newest event recorded for the session, across both
/// event tables.
pub fn last_activity(conn: &Connection, session_id: i64) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn.query_row(
        "SELECT MAX(ts) FROM (
             SELECT MAX(timestamp) AS ts FROM blink_events WHERE session_id = ?1
             UNION ALL
             SELECT MAX(timestamp) AS ts FROM performance_samples WHERE session_id = ?1
         )",
        params![session_id],
        |row| row.get(0),
    )?;
    parse_optional_datetime(raw, "last_activity")
}

/// Recomputes blink totals from committed rows. Duration runs up to `as_of`
/// for an open session and up to the end timestamp for a closed one.
pub fn refresh_aggregates(conn: &Connection, session_id: i64, as_of: DateTime<Utc>) -> Result<()> {
    let bounds: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT start_time, end_time FROM sessions WHERE id = ?1",
            params![session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((start_time, end_time)) = bounds else {
        return Err(anyhow!("session {session_id} not found"));
    };
    let started_at = parse_datetime(&start_time, "start_time")?;
    let until = parse_optional_datetime(end_time, "end_time")?.unwrap_or(as_of);
    let duration_secs = (until - started_at).num_seconds().max(0);

    conn.execute(
        "UPDATE sessions SET
             total_blinks = (SELECT COALESCE(SUM(blink_count), 0) FROM blink_events WHERE session_id = ?1),
             max_blink_rate = (SELECT COALESCE(MAX(blink_rate), 0.0) FROM blink_events WHERE session_id = ?1),
             avg_blink_rate = (SELECT COALESCE(AVG(blink_rate), 0.0) FROM blink_events WHERE session_id = ?1),
             duration_secs = ?2
         WHERE id = ?1",
        params![session_id, duration_secs],
    )?;
    Ok(())
}

/// Sets the end timestamp, finalizes aggregates and records an update intent.
pub fn close_session(conn: &Connection, session_id: i64, ended_at: DateTime<Utc>) -> Result<Session> {
    refresh_aggregates(conn, session_id, ended_at)?;
    let updated = conn.execute(
        "UPDATE sessions SET end_time = ?1 WHERE id = ?2 AND end_time IS NULL",
        params![format_datetime(&ended_at), session_id],
    )?;
    if updated == 0 {
        return Err(anyhow!("session {session_id} is not open"));
    }

    let session =
        load_session(conn, session_id)?.ok_or_else(|| anyhow!("session {session_id} vanished"))?;
    record_intent(conn, SESSIONS_TABLE, session_id, SyncAction::Update, &session)?;
    Ok(session)
}

pub fn mark_synced(conn: &Connection, session_id: i64, cloud_session_id: &str) -> Result<Option<Session>> {
    let updated = conn.execute(
        "UPDATE sessions SET is_synced = 1, cloud_session_id = ?1 WHERE id = ?2",
        params![cloud_session_id, session_id],
    )?;
    if updated == 0 {
        return Ok(None);
    }

    let session = load_session(conn, session_id)?;
    if let Some(session) = &session {
        record_intent(conn, SESSIONS_TABLE, session_id, SyncAction::Update, session)?;
    }
    Ok(session)
}

pub fn session_stats(conn: &Connection, session_id: i64) -> Result<Option<SessionStats>> {
    let Some(session) = load_session(conn, session_id)? else {
        return Ok(None);
    };

    let blinks = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(blink_count), 0), AVG(blink_rate), MAX(blink_rate),
                MIN(timestamp), MAX(timestamp)
         FROM blink_events WHERE session_id = ?1",
        params![session_id],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        },
    )?;
    let blinks = BlinkSummary {
        event_count: to_u64(blinks.0, "event_count")?,
        total_blinks: to_u64(blinks.1, "total_blinks")?,
        avg_rate: blinks.2,
        max_rate: blinks.3,
        first_at: parse_optional_datetime(blinks.4, "first_at")?,
        last_at: parse_optional_datetime(blinks.5, "last_at")?,
    };

    let performance = conn.query_row(
        "SELECT COUNT(*), AVG(cpu_usage), AVG(memory_usage), AVG(battery_level)
         FROM performance_samples WHERE session_id = ?1",
        params![session_id],
        |row| {
            Ok(PerformanceSummary {
                sample_count: row.get::<_, i64>(0)?.max(0) as u64,
                avg_cpu: row.get(1)?,
                avg_memory: row.get(2)?,
                avg_battery: row.get(3)?,
            })
        },
    )?;

    // Open sessions report elapsed time so far rather than the last flush's value.
    let duration_secs = match session.end_time {
        Some(_) => session.duration_secs as f64,
        None => (Utc::now() - session.start_time).num_seconds().max(0) as f64,
    };

    Ok(Some(SessionStats {
        duration_minutes: duration_secs / 60.0,
        session,
        blinks,
        performance,
    }))
}

impl Database {
    pub async fn get_session(&self, session_id: i64) -> Result<Option<Session>> {
        self.execute(move |conn| load_session(conn, session_id)).await
    }

    pub async fn get_recent_sessions(
        &self,
        limit: usize,
        user_id: Option<String>,
    ) -> Result<Vec<Session>> {
        self.execute(move |conn| recent_sessions(conn, limit, user_id.as_deref()))
            .await
    }

    pub async fn get_session_stats(&self, session_id: i64) -> Result<Option<SessionStats>> {
        self.execute(move |conn| session_stats(conn, session_id)).await
    }
}
