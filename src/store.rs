//! Public entry point: wires the ingestion queue, the batch writer, the
//! session manager and the read-only query connection together.

use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::config::StoreConfig;
use crate::db::{
    BlinkEvent, LazyDatabase, PerformanceSample, RetentionReport, Session, SessionStats, SyncIntent,
};
use crate::error::{Result, StoreError};
use crate::ingest::{
    ingest_channel, spawn_batch_writer, stats::IngestCounters, IngestQueue, IngestStats,
    StartupReport, WriterFault, WriterHandle, WriterShared, WriterStartup,
};
use crate::session::{CurrentSession, SessionManager};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub struct EventStore {
    config: StoreConfig,
    queue: IngestQueue,
    sessions: SessionManager,
    reader: Arc<LazyDatabase>,
    counters: Arc<IngestCounters>,
    faults: Mutex<Option<mpsc::UnboundedReceiver<WriterFault>>>,
    startup: Option<StartupReport>,
    writer: WriterHandle,
}

impl EventStore {
    /// Opens the database, recovers it and starts the writer.
    ///
    /// Fails with `RecoveryFailure` when the file or its write-ahead log is
    /// corrupt. An unavailable file does not fail the open: the store starts
    /// degraded, producers drop on a full queue, and the writer keeps
    /// retrying in the background.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| StoreError::Config(format!("{err:#}")))?;

        let counters = Arc::new(IngestCounters::default());
        let (queue, records) = ingest_channel(config.queue_capacity, Arc::clone(&counters));
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let current = CurrentSession::new();

        let (writer, startup) = spawn_batch_writer(
            config.clone(),
            records,
            WriterShared {
                counters: Arc::clone(&counters),
                faults: fault_tx,
                current: current.clone(),
            },
        )?;

        let startup = match startup {
            WriterStartup::Ready(report) => {
                log_info!(
                    "event store open at {} ({} dangling sessions closed, {} overflow records replayed)",
                    config.db_path.display(),
                    report.reconciled.len(),
                    report.replayed
                );
                Some(report)
            }
            WriterStartup::Degraded(err) => {
                log_warn!("event store opened degraded: {err}");
                None
            }
        };

        let reader = Arc::new(LazyDatabase::new(
            config.db_path.clone(),
            config.busy_timeout(),
        ));
        let sessions = SessionManager::new(writer.control().clone(), Arc::clone(&reader), current);

        Ok(Self {
            config,
            queue,
            sessions,
            reader,
            counters,
            faults: Mutex::new(Some(fault_rx)),
            startup,
            writer,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// What recovery did at open. `None` when the store started degraded.
    pub fn startup_report(&self) -> Option<&StartupReport> {
        self.startup.as_ref()
    }

    /// Producer handle for other threads or tasks.
    pub fn ingest(&self) -> IngestQueue {
        self.queue.clone()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn log_blink(&self, blink_count: u32, blink_rate: f64, eye_aspect_ratio: Option<f64>) {
        self.queue.log_blink(blink_count, blink_rate, eye_aspect_ratio);
    }

    pub fn log_performance(&self, cpu_usage: f64, memory_usage: f64, battery_level: Option<u8>) {
        self.queue
            .log_performance(cpu_usage, memory_usage, battery_level);
    }

    pub async fn auto_create_session(&self) -> Result<Session> {
        self.sessions.auto_create_session().await
    }

    pub async fn end_current_session(&self) -> Result<Option<Session>> {
        self.sessions.end_current_session().await
    }

    pub fn current_session_id(&self) -> Option<i64> {
        self.sessions.current_session_id()
    }

    pub async fn get_current_session(&self) -> Result<Option<Session>> {
        self.sessions.get_current_session().await
    }

    pub async fn get_session_stats(&self, session_id: i64) -> Result<Option<SessionStats>> {
        self.sessions.get_session_stats(session_id).await
    }

    pub async fn get_recent_sessions(
        &self,
        limit: usize,
        user_id: Option<&str>,
    ) -> Result<Vec<Session>> {
        self.sessions.get_recent_sessions(limit, user_id).await
    }

    /// Recent sessions of the configured user, or every session when no
    /// user is configured.
    pub async fn get_user_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let user_id = self.config.user.as_ref().map(|user| user.id.as_str());
        self.get_recent_sessions(limit, user_id).await
    }

    pub async fn get_blink_events(&self, session_id: i64) -> Result<Vec<BlinkEvent>> {
        Ok(self.reader.get().await?.get_blink_events(session_id).await?)
    }

    pub async fn get_blinks_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BlinkEvent>> {
        Ok(self
            .reader
            .get()
            .await?
            .get_blinks_between(from, to, limit)
            .await?)
    }

    pub async fn get_performance_samples(&self, session_id: i64) -> Result<Vec<PerformanceSample>> {
        Ok(self
            .reader
            .get()
            .await?
            .get_performance_samples(session_id)
            .await?)
    }

    /// Commits everything enqueued before this call.
    pub async fn flush(&self) -> Result<usize> {
        self.writer.control().flush().await
    }

    pub async fn cleanup_old_data(&self, days_to_keep: u32) -> Result<RetentionReport> {
        self.writer.control().cleanup(days_to_keep).await
    }

    /// Oldest unconsumed sync intents first.
    pub async fn pending_sync_intents(&self, limit: usize) -> Result<Vec<SyncIntent>> {
        Ok(self
            .reader
            .get()
            .await?
            .get_pending_sync_intents(limit)
            .await?)
    }

    pub async fn pending_sync_intent_count(&self) -> Result<u64> {
        Ok(self.reader.get().await?.count_pending_sync_intents().await?)
    }

    pub async fn mark_sync_intents_consumed(&self, ids: &[i64]) -> Result<usize> {
        self.writer
            .control()
            .mark_intents_consumed(ids.to_vec())
            .await
    }

    pub async fn mark_session_synced(
        &self,
        session_id: i64,
        cloud_session_id: impl Into<String>,
    ) -> Result<Option<Session>> {
        self.sessions
            .mark_session_synced(session_id, cloud_session_id)
            .await
    }

    pub fn ingest_stats(&self) -> IngestStats {
        self.counters.snapshot()
    }

    /// Receiver for writer faults. Handed out once.
    pub fn take_faults(&self) -> Option<mpsc::UnboundedReceiver<WriterFault>> {
        let mut guard = match self.faults.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take()
    }

    /// Bytes on disk for the database file plus its write-ahead log.
    pub fn database_size(&self) -> Result<u64> {
        let main = fs::metadata(&self.config.db_path)?.len();
        let wal = match fs::metadata(wal_path(&self.config.db_path)) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        Ok(main + wal)
    }

    /// Final flush, WAL checkpoint, writer join. Returns the number of
    /// records the final flush committed.
    pub async fn close(self) -> Result<usize> {
        let flushed = self.writer.shutdown().await?;
        log_info!("event store closed ({flushed} records in final flush)");
        Ok(flushed)
    }
}

fn wal_path(db_path: &Path) -> PathBuf {
    let mut name = OsString::from(db_path.as_os_str());
    name.push("-wal");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_sits_next_to_the_database() {
        assert_eq!(
            wal_path(Path::new("/tmp/store/blinks.sqlite3")),
            PathBuf::from("/tmp/store/blinks.sqlite3-wal")
        );
    }

    #[test]
    fn invalid_config_is_rejected_before_anything_opens() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::with_db_path(dir.path().join("blinks.sqlite3"));
        config.batch_size = 0;

        let err = EventStore::open(config).err().unwrap();
        assert!(matches!(err, StoreError::Config(_)));
        assert!(!dir.path().join("blinks.sqlite3").exists());
    }
}
