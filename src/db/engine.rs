//! Opening, recovering and checkpointing the SQLite file.
//!
//! The writer owns the only read-write connection. Opening it replays any
//! committed-but-not-checkpointed WAL frames (SQLite does this on first
//! access), verifies the file with `quick_check`, folds the WAL into the main
//! file and brings the schema up to date. Only then does the writer accept
//! commands.

use std::{fs, path::Path, time::Duration};

use rusqlite::{Connection, ErrorCode, OpenFlags};

use crate::db::migrations::run_migrations;
use crate::error::{Result, StoreError};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub fn open_write_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    ensure_private_dir(path)?;

    let mut conn = Connection::open(path).map_err(|err| classify(path, err))?;
    configure_write_pragmas(&conn, busy_timeout).map_err(|err| classify(path, err))?;
    verify_integrity(&conn)?;

    let (busy, log_frames, checkpointed) = checkpoint(&conn).map_err(|err| classify(path, err))?;
    if busy != 0 {
        log_warn!(
            "startup checkpoint incomplete ({checkpointed}/{log_frames} frames); WAL stays authoritative"
        );
    } else if log_frames > 0 {
        log_info!("recovered {checkpointed} WAL frames into {}", path.display());
    }

    run_migrations(&mut conn).map_err(|err| StoreError::RecoveryFailure {
        reason: format!("{err:#}"),
    })?;

    Ok(conn)
}

/// Read-only connection for query paths. WAL mode lets it read committed
/// state while the writer holds an open transaction.
pub fn open_read_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|err| classify(path, err))?;
    conn.busy_timeout(busy_timeout)
        .map_err(|err| classify(path, err))?;
    Ok(conn)
}

/// `PRAGMA wal_checkpoint(TRUNCATE)`: returns (busy, wal frames, checkpointed frames).
pub fn checkpoint(conn: &Connection) -> rusqlite::Result<(i64, i64, i64)> {
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    })
}

fn configure_write_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        log_warn!("journal_mode is {mode}, expected wal");
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(())
}

fn verify_integrity(conn: &Connection) -> Result<()> {
    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|err| StoreError::RecoveryFailure {
            reason: format!("quick_check could not run: {err}"),
        })?;
    if verdict != "ok" {
        return Err(StoreError::RecoveryFailure {
            reason: format!("quick_check reported: {verdict}"),
        });
    }
    Ok(())
}

fn ensure_private_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    if parent.exists() {
        return Ok(());
    }

    fs::create_dir_all(parent).map_err(|err| StoreError::StorageUnavailable {
        path: path.to_path_buf(),
        reason: format!("failed to create directory {}: {err}", parent.display()),
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) = fs::set_permissions(parent, fs::Permissions::from_mode(0o700)) {
            log_warn!("could not restrict permissions on {}: {err}", parent.display());
        }
    }

    Ok(())
}

/// Corruption means recovery failed; anything else means the file is merely
/// unavailable right now.
fn classify(path: &Path, err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
            StoreError::RecoveryFailure {
                reason: format!("{}: {err}", path.display()),
            }
        }
        _ => StoreError::StorageUnavailable {
            path: path.to_path_buf(),
            reason: err.to_string(),
        },
    }
}
