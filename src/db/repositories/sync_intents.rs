//! Append-only log of mutations awaiting the external sync agent.
//!
//! Intents are written with the same connection, inside the same transaction,
//! as the row they describe, so a committed row always has its intent.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_action, parse_datetime, parse_optional_datetime, to_i64},
    models::{SyncAction, SyncIntent},
};

fn row_to_intent(row: &Row) -> Result<SyncIntent> {
    let action: String = row.get("action")?;
    let payload: String = row.get("payload")?;
    let created_at: String = row.get("created_at")?;
    let consumed_at: Option<String> = row.get("consumed_at")?;

    Ok(SyncIntent {
        id: row.get("id")?,
        table_name: row.get("table_name")?,
        record_id: row.get("record_id")?,
        action: parse_action(&action)?,
        payload: serde_json::from_str(&payload).context("failed to decode intent payload")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        consumed_at: parse_optional_datetime(consumed_at, "consumed_at")?,
    })
}

pub fn record_intent<T: Serialize>(
    conn: &Connection,
    table_name: &str,
    record_id: i64,
    action: SyncAction,
    snapshot: &T,
) -> Result<i64> {
    let payload = serde_json::to_string(snapshot).context("failed to encode intent payload")?;
    conn.prepare_cached(
        "INSERT INTO sync_intents (table_name, record_id, action, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?
    .execute(params![
        table_name,
        record_id,
        action.as_str(),
        payload,
        format_datetime(&Utc::now()),
    ])?;
    Ok(conn.last_insert_rowid())
}

/// Oldest unconsumed intents first.
pub fn pending_intents(conn: &Connection, limit: usize) -> Result<Vec<SyncIntent>> {
    let mut stmt = conn.prepare(
        "SELECT id, table_name, record_id, action, payload, created_at, consumed_at
         FROM sync_intents
         WHERE consumed_at IS NULL
         ORDER BY id ASC
         LIMIT ?1",
    )?;
    let mut rows = stmt.query(params![to_i64(limit as u64)?])?;
    let mut intents = Vec::new();
    while let Some(row) = rows.next()? {
        intents.push(row_to_intent(row)?);
    }
    Ok(intents)
}

pub fn pending_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_intents WHERE consumed_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

/// Marks the given intents consumed. Already-consumed ids are left alone, so
/// the call is safe to repeat. Returns how many rows changed.
pub fn mark_consumed(conn: &Connection, ids: &[i64], consumed_at: DateTime<Utc>) -> Result<usize> {
    let stamp = format_datetime(&consumed_at);
    let mut stmt = conn.prepare_cached(
        "UPDATE sync_intents SET consumed_at = ?1 WHERE id = ?2 AND consumed_at IS NULL",
    )?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute(params![stamp, id])?;
    }
    Ok(changed)
}

impl Database {
    pub async fn get_pending_sync_intents(&self, limit: usize) -> Result<Vec<SyncIntent>> {
        self.execute(move |conn| pending_intents(conn, limit)).await
    }

    pub async fn count_pending_sync_intents(&self) -> Result<u64> {
        self.execute(|conn| pending_count(conn)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::run_migrations;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        conn
    }

    #[test]
    fn intents_keep_their_payload() {
        let conn = conn();
        let id = record_intent(
            &conn,
            "blink_events",
            12,
            SyncAction::Insert,
            &serde_json::json!({ "blinkCount": 3 }),
        )
        .unwrap();

        let pending = pending_intents(&conn, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].record_id, 12);
        assert_eq!(pending[0].action, SyncAction::Insert);
        assert_eq!(pending[0].payload["blinkCount"], 3);
    }

    #[test]
    fn consuming_is_repeatable() {
        let conn = conn();
        let a = record_intent(&conn, "sessions", 1, SyncAction::Insert, &1).unwrap();
        let b = record_intent(&conn, "sessions", 1, SyncAction::Update, &2).unwrap();

        assert_eq!(mark_consumed(&conn, &[a], Utc::now()).unwrap(), 1);
        assert_eq!(mark_consumed(&conn, &[a], Utc::now()).unwrap(), 0);
        assert_eq!(pending_count(&conn).unwrap(), 1);
        assert_eq!(pending_intents(&conn, 10).unwrap()[0].id, b);
    }
}
