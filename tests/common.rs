#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use blink_store_lib::StoreConfig;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags};

/// Config rooted in a fresh temp dir. Latency flushes are pushed far out so
/// tests control when batches commit; retries are fast.
pub fn temp_config() -> (tempfile::TempDir, StoreConfig) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let mut config = StoreConfig::with_db_path(dir.path().join("blinks.sqlite3"));
    config.max_flush_latency_ms = 600_000;
    config.retry_backoff_ms = 1;
    config.reopen_interval_ms = 50;
    (dir, config)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn open_read_write(path: &Path) -> Connection {
    let conn = Connection::open(path).expect("open read-write connection");
    conn.busy_timeout(Duration::from_secs(5))
        .expect("set busy timeout");
    conn
}

pub fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get(0))
        .expect("count query")
}

/// Same text format the store writes.
pub fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
