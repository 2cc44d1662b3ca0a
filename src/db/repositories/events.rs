use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, to_i64},
    models::{BlinkEvent, NewBlink, NewPerformanceSample, PerformanceSample},
};

pub const BLINK_EVENTS_TABLE: &str = "blink_events";
pub const PERFORMANCE_SAMPLES_TABLE: &str = "performance_samples";

fn row_to_blink(row: &Row) -> Result<BlinkEvent> {
    let timestamp: String = row.get("timestamp")?;
    let blink_count: i64 = row.get("blink_count")?;

    Ok(BlinkEvent {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        timestamp: parse_datetime(&timestamp, "timestamp")?,
        blink_count: u32::try_from(blink_count)
            .with_context(|| format!("blink_count {blink_count} out of range"))?,
        blink_rate: row.get("blink_rate")?,
        eye_aspect_ratio: row.get("eye_aspect_ratio")?,
        is_synced: row.get("is_synced")?,
    })
}

fn row_to_sample(row: &Row) -> Result<PerformanceSample> {
    let timestamp: String = row.get("timestamp")?;
    let battery_level: Option<i64> = row.get("battery_level")?;

    Ok(PerformanceSample {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        timestamp: parse_datetime(&timestamp, "timestamp")?,
        cpu_usage: row.get("cpu_usage")?,
        memory_usage: row.get("memory_usage")?,
        battery_level: battery_level.map(|level| level.clamp(0, 100) as u8),
    })
}

pub fn insert_blink(conn: &Connection, session_id: i64, blink: &NewBlink) -> Result<BlinkEvent> {
    conn.prepare_cached(
        "INSERT INTO blink_events (session_id, timestamp, blink_count, blink_rate, eye_aspect_ratio)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?
    .execute(params![
        session_id,
        format_datetime(&blink.timestamp),
        i64::from(blink.blink_count),
        blink.blink_rate,
        blink.eye_aspect_ratio,
    ])?;

    Ok(BlinkEvent {
        id: conn.last_insert_rowid(),
        session_id,
        timestamp: blink.timestamp,
        blink_count: blink.blink_count,
        blink_rate: blink.blink_rate,
        eye_aspect_ratio: blink.eye_aspect_ratio,
        is_synced: false,
    })
}

pub fn insert_performance(
    conn: &Connection,
    session_id: i64,
    sample: &NewPerformanceSample,
) -> Result<PerformanceSample> {
    conn.prepare_cached(
        "INSERT INTO performance_samples (session_id, timestamp, cpu_usage, memory_usage, battery_level)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?
    .execute(params![
        session_id,
        format_datetime(&sample.timestamp),
        sample.cpu_usage,
        sample.memory_usage,
        sample.battery_level.map(i64::from),
    ])?;

    Ok(PerformanceSample {
        id: conn.last_insert_rowid(),
        session_id,
        timestamp: sample.timestamp,
        cpu_usage: sample.cpu_usage,
        memory_usage: sample.memory_usage,
        battery_level: sample.battery_level,
    })
}

pub fn blinks_for_session(conn: &Connection, session_id: i64) -> Result<Vec<BlinkEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, timestamp, blink_count, blink_rate, eye_aspect_ratio, is_synced
         FROM blink_events
         WHERE session_id = ?1
         ORDER BY timestamp ASC, id ASC",
    )?;
    let mut rows = stmt.query(params![session_id])?;
    let mut events = Vec::new();
    while let Some(row) = rows.next()? {
        events.push(row_to_blink(row)?);
    }
    Ok(events)
}

/// Blink events with `from <= timestamp < to`, across all sessions.
pub fn blinks_between(
    conn: &Connection,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<BlinkEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, timestamp, blink_count, blink_rate, eye_aspect_ratio, is_synced
         FROM blink_events
         WHERE timestamp >= ?1 AND timestamp < ?2
         ORDER BY timestamp ASC, id ASC
         LIMIT ?3",
    )?;
    let mut rows = stmt.query(params![
        format_datetime(&from),
        format_datetime(&to),
        to_i64(limit as u64)?,
    ])?;
    let mut events = Vec::new();
    while let Some(row) = rows.next()? {
        events.push(row_to_blink(row)?);
    }
    Ok(events)
}

pub fn performance_for_session(conn: &Connection, session_id: i64) -> Result<Vec<PerformanceSample>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, timestamp, cpu_usage, memory_usage, battery_level
         FROM performance_samples
         WHERE session_id = ?1
         ORDER BY timestamp ASC, id ASC",
    )?;
    let mut rows = stmt.query(params![session_id])?;
    let mut samples = Vec::new();
    while let Some(row) = rows.next()? {
        samples.push(row_to_sample(row)?);
    }
    Ok(samples)
}

impl Database {
    pub async fn get_blink_events(&self, session_id: i64) -> Result<Vec<BlinkEvent>> {
        self.execute(move |conn| blinks_for_session(conn, session_id))
            .await
    }

    pub async fn get_blinks_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BlinkEvent>> {
        self.execute(move |conn| blinks_between(conn, from, to, limit))
            .await
    }

    pub async fn get_performance_samples(&self, session_id: i64) -> Result<Vec<PerformanceSample>> {
        self.execute(move |conn| performance_for_session(conn, session_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::run_migrations;
    use crate::db::repositories::sessions::insert_session;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn setup() -> (Connection, i64) {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        run_migrations(&mut conn).unwrap();
        let session = insert_session(&conn, at(0), None).unwrap();
        (conn, session.id)
    }

    #[test]
    fn blinks_read_back_in_time_order() {
        let (conn, session_id) = setup();
        for (secs, count) in [(30, 2), (10, 1), (20, 4)] {
            insert_blink(
                &conn,
                session_id,
                &NewBlink {
                    timestamp: at(secs),
                    blink_count: count,
                    blink_rate: 15.0,
                    eye_aspect_ratio: Some(0.27),
                },
            )
            .unwrap();
        }

        let events = blinks_for_session(&conn, session_id).unwrap();
        assert_eq!(
            events.iter().map(|e| e.blink_count).collect::<Vec<_>>(),
            vec![1, 4, 2]
        );
        assert_eq!(events[0].eye_aspect_ratio, Some(0.27));

        let window = blinks_between(&conn, at(10), at(30), 100).unwrap();
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn unknown_session_violates_foreign_key() {
        let (conn, _) = setup();
        let err = insert_performance(
            &conn,
            9999,
            &NewPerformanceSample {
                timestamp: at(1),
                cpu_usage: 5.0,
                memory_usage: 40.0,
                battery_level: None,
            },
        );
        assert!(err.is_err());
    }

    #[test]
    fn deleting_session_cascades_to_events() {
        let (conn, session_id) = setup();
        insert_performance(
            &conn,
            session_id,
            &NewPerformanceSample {
                timestamp: at(1),
                cpu_usage: 5.0,
                memory_usage: 40.0,
                battery_level: Some(80),
            },
        )
        .unwrap();
        assert_eq!(performance_for_session(&conn, session_id).unwrap()[0].battery_level, Some(80));

        conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])
            .unwrap();
        assert!(performance_for_session(&conn, session_id).unwrap().is_empty());
    }
}
