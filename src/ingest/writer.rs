//! The batch writer: sole owner of the read-write connection.
//!
//! Runs on its own OS thread with a single-threaded Tokio runtime. Records
//! arrive on the bounded ingestion channel, commands on an unbounded control
//! channel. Records are buffered and committed in one transaction when the
//! buffer reaches `batch_size`, when the oldest buffered record has waited
//! `max_flush_latency`, or when a command forces a flush.
//!
//! Before any control command is handled, records already sitting in the
//! queue are drained into the buffer, so a command never overtakes events
//! that were enqueued before it was sent.

use std::{
    collections::BTreeSet,
    ops::ControlFlow,
    sync::{mpsc as std_mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{Connection, TransactionBehavior};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant, MissedTickBehavior};

use crate::config::{StoreConfig, UserIdentity};
use crate::db::{
    engine::{checkpoint, open_write_connection},
    models::{Session, SyncAction},
    repositories::{
        events::{insert_blink, insert_performance, BLINK_EVENTS_TABLE, PERFORMANCE_SAMPLES_TABLE},
        retention::{cutoff_for, delete_expired},
        sessions::{close_session, insert_session, load_session, mark_synced, refresh_aggregates},
        sync_intents::{mark_consumed, record_intent},
        RetentionReport,
    },
};
use crate::error::{Result, StoreError};
use crate::ingest::{
    overflow::{OverflowEntry, OverflowLog},
    queue::{EventRecord, RecordReceiver},
    stats::{FaultKind, IngestCounters, WriterFault},
};
use crate::session::{CurrentSession, SessionLifecycle};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Bounded exponential backoff with ±20% jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: config.retry_backoff(),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        let nominal = self
            .base_backoff
            .saturating_mul(1u32 << doublings)
            .min(MAX_BACKOFF);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        nominal.mul_f64(jitter)
    }
}

struct RetryExhausted {
    attempts: u32,
    error: anyhow::Error,
}

impl RetryExhausted {
    fn into_error(self, records: usize) -> StoreError {
        StoreError::TransactionFailure {
            attempts: self.attempts,
            records,
            source: self.error,
        }
    }
}

/// Runs `op` until it succeeds or the policy gives up. Each attempt is
/// expected to open and commit its own transaction so a failure rolls back.
async fn with_retries<T>(
    conn: &mut Connection,
    policy: &RetryPolicy,
    what: &str,
    mut op: impl FnMut(&mut Connection) -> anyhow::Result<T>,
) -> std::result::Result<T, RetryExhausted> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(conn) {
            Ok(value) => return Ok(value),
            Err(error) if attempt > policy.max_retries => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    error,
                })
            }
            Err(error) => {
                let delay = policy.delay(attempt);
                log_warn!(
                    "{what} failed on attempt {attempt}, retrying in {}ms: {error:#}",
                    delay.as_millis()
                );
                sleep(delay).await;
            }
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRecord {
    session_id: i64,
    record: EventRecord,
}

/// Inserts every record with its sync intent and refreshes the aggregates of
/// each touched session. Runs inside the caller's transaction.
fn write_records(conn: &Connection, batch: &[PendingRecord], now: DateTime<Utc>) -> anyhow::Result<()> {
    let mut touched = BTreeSet::new();
    for pending in batch {
        match &pending.record {
            EventRecord::Blink(blink) => {
                let row = insert_blink(conn, pending.session_id, blink)?;
                record_intent(conn, BLINK_EVENTS_TABLE, row.id, SyncAction::Insert, &row)?;
            }
            EventRecord::Performance(sample) => {
                let row = insert_performance(conn, pending.session_id, sample)?;
                record_intent(conn, PERFORMANCE_SAMPLES_TABLE, row.id, SyncAction::Insert, &row)?;
            }
        }
        touched.insert(pending.session_id);
    }

    for session_id in touched {
        refresh_aggregates(conn, session_id, now)?;
    }
    Ok(())
}

fn commit_batch(conn: &mut Connection, batch: &[PendingRecord], now: DateTime<Utc>) -> anyhow::Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    write_records(&tx, batch, now)?;
    tx.commit()?;
    Ok(())
}

/// Commits parked records. Records whose session no longer exists, or never
/// had one, are gathered into a recovery session spanning their timestamps.
fn commit_replay(
    conn: &mut Connection,
    entries: &[OverflowEntry],
    user: Option<&UserIdentity>,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut batch = Vec::with_capacity(entries.len());
    let mut orphans = Vec::new();
    for entry in entries {
        let known = match entry.session_id {
            Some(id) => load_session(&tx, id)?.map(|session| session.id),
            None => None,
        };
        match known {
            Some(session_id) => batch.push(PendingRecord {
                session_id,
                record: entry.record.clone(),
            }),
            None => orphans.push(entry.record.clone()),
        }
    }

    let mut recovery = None;
    if !orphans.is_empty() {
        let first = orphans.iter().map(EventRecord::timestamp).min().unwrap_or(now);
        let last = orphans.iter().map(EventRecord::timestamp).max().unwrap_or(now);
        let session = insert_session(&tx, first, user)?;
        batch.extend(orphans.into_iter().map(|record| PendingRecord {
            session_id: session.id,
            record,
        }));
        recovery = Some((session.id, last));
    }

    write_records(&tx, &batch, now)?;
    if let Some((session_id, last)) = recovery {
        close_session(&tx, session_id, last)?;
    }
    tx.commit()?;
    Ok(())
}

pub enum ControlCommand {
    Flush {
        reply: oneshot::Sender<Result<usize>>,
    },
    StartSession {
        reply: oneshot::Sender<Result<Session>>,
    },
    EndSession {
        reply: oneshot::Sender<Result<Option<Session>>>,
    },
    MarkIntentsConsumed {
        ids: Vec<i64>,
        reply: oneshot::Sender<Result<usize>>,
    },
    MarkSessionSynced {
        session_id: i64,
        cloud_session_id: String,
        reply: oneshot::Sender<Result<Option<Session>>>,
    },
    Cleanup {
        days_to_keep: u32,
        reply: oneshot::Sender<Result<RetentionReport>>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<Result<usize>>>,
    },
}

impl ControlCommand {
    /// Answers the command with `err` without touching storage.
    fn reject(self, err: &StoreError) {
        match self {
            ControlCommand::Flush { reply } => {
                let _ = reply.send(Err(err.duplicate()));
            }
            ControlCommand::StartSession { reply } => {
                let _ = reply.send(Err(err.duplicate()));
            }
            ControlCommand::EndSession { reply } => {
                let _ = reply.send(Err(err.duplicate()));
            }
            ControlCommand::MarkIntentsConsumed { reply, .. } => {
                let _ = reply.send(Err(err.duplicate()));
            }
            ControlCommand::MarkSessionSynced { reply, .. } => {
                let _ = reply.send(Err(err.duplicate()));
            }
            ControlCommand::Cleanup { reply, .. } => {
                let _ = reply.send(Err(err.duplicate()));
            }
            ControlCommand::Shutdown { reply } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(0));
                }
            }
        }
    }
}

type ControlReceiver = mpsc::UnboundedReceiver<ControlCommand>;

/// Sending side of the control channel.
#[derive(Clone)]
pub struct WriterControl {
    sender: mpsc::UnboundedSender<ControlCommand>,
}

impl WriterControl {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> ControlCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(build(reply_tx))
            .map_err(|_| StoreError::WriterGone)?;
        reply_rx.await.map_err(|_| StoreError::WriterGone)?
    }

    /// Commits everything enqueued so far. Returns the number of records.
    pub async fn flush(&self) -> Result<usize> {
        self.request(|reply| ControlCommand::Flush { reply }).await
    }

    pub async fn start_session(&self) -> Result<Session> {
        self.request(|reply| ControlCommand::StartSession { reply })
            .await
    }

    pub async fn end_session(&self) -> Result<Option<Session>> {
        self.request(|reply| ControlCommand::EndSession { reply })
            .await
    }

    pub async fn mark_intents_consumed(&self, ids: Vec<i64>) -> Result<usize> {
        self.request(|reply| ControlCommand::MarkIntentsConsumed { ids, reply })
            .await
    }

    pub async fn mark_session_synced(
        &self,
        session_id: i64,
        cloud_session_id: String,
    ) -> Result<Option<Session>> {
        self.request(|reply| ControlCommand::MarkSessionSynced {
            session_id,
            cloud_session_id,
            reply,
        })
        .await
    }

    pub async fn cleanup(&self, days_to_keep: u32) -> Result<RetentionReport> {
        self.request(|reply| ControlCommand::Cleanup {
            days_to_keep,
            reply,
        })
        .await
    }

    async fn shutdown(&self) -> Result<usize> {
        self.request(|reply| ControlCommand::Shutdown { reply: Some(reply) })
            .await
    }
}

/// State the writer shares with the facade.
#[derive(Clone)]
pub struct WriterShared {
    pub counters: Arc<IngestCounters>,
    pub faults: mpsc::UnboundedSender<WriterFault>,
    pub current: CurrentSession,
}

impl WriterShared {
    fn report(&self, fault: WriterFault) {
        // Nobody listening is fine; the fault has been logged already.
        let _ = self.faults.send(fault);
    }
}

#[derive(Debug, Default)]
pub struct StartupReport {
    /// Sessions a previous process left open, now closed.
    pub reconciled: Vec<Session>,
    /// Overflow records committed during startup.
    pub replayed: usize,
}

#[derive(Debug)]
pub enum WriterStartup {
    Ready(StartupReport),
    /// The database could not be opened; the writer keeps retrying.
    Degraded(StoreError),
}

struct BatchWriter {
    conn: Connection,
    lifecycle: SessionLifecycle,
    buffer: Vec<PendingRecord>,
    oldest: Option<Instant>,
    batch_size: usize,
    max_flush_latency: Duration,
    drain_limit: usize,
    retry: RetryPolicy,
    overflow: OverflowLog,
    shared: WriterShared,
}

impl BatchWriter {
    /// Opens and recovers the database, closes dangling sessions and replays
    /// the overflow log.
    async fn open(config: &StoreConfig, shared: WriterShared) -> Result<(Self, StartupReport)> {
        let mut conn = open_write_connection(&config.db_path, config.busy_timeout())?;

        let mut lifecycle = SessionLifecycle::new(shared.current.clone(), config.user.clone());
        let reconciled =
            lifecycle
                .reconcile(&mut conn)
                .map_err(|err| StoreError::RecoveryFailure {
                    reason: format!("session reconciliation failed: {err:#}"),
                })?;

        let mut writer = Self {
            conn,
            lifecycle,
            buffer: Vec::with_capacity(config.batch_size),
            oldest: None,
            batch_size: config.batch_size,
            max_flush_latency: config.max_flush_latency(),
            drain_limit: config.queue_capacity,
            retry: RetryPolicy::from_config(config),
            overflow: OverflowLog::new(config.overflow_path()),
            shared,
        };
        let replayed = writer.replay_overflow().await;

        Ok((
            writer,
            StartupReport {
                reconciled,
                replayed,
            },
        ))
    }

    async fn replay_overflow(&mut self) -> usize {
        let entries = match self.overflow.load() {
            Ok(entries) => entries,
            Err(err) => {
                log_error!("could not read overflow log: {err:#}");
                self.shared
                    .report(WriterFault::new(FaultKind::ReplayFailure, 0, format!("{err:#}")));
                return 0;
            }
        };
        if entries.is_empty() {
            // nothing readable left, only torn fragments if the file exists
            if let Err(err) = self.overflow.clear() {
                log_warn!(
                    "could not remove unreadable overflow log {}: {err:#}",
                    self.overflow.path().display()
                );
            }
            return 0;
        }

        let count = entries.len();
        let user = self.lifecycle.user().cloned();
        let replay = with_retries(&mut self.conn, &self.retry, "overflow replay", |conn| {
            commit_replay(conn, &entries, user.as_ref(), Utc::now())
        })
        .await;

        match replay {
            Ok(()) => {
                if let Err(err) = self.overflow.clear() {
                    log_error!(
                        "replayed {count} overflow records but could not remove {}: {err:#}",
                        self.overflow.path().display()
                    );
                }
                self.shared.counters.record_replayed(count);
                log_info!("replayed {count} records from the overflow log");
                count
            }
            Err(exhausted) => {
                log_error!(
                    "overflow replay failed after {} attempts, keeping {count} records parked: {:#}",
                    exhausted.attempts,
                    exhausted.error
                );
                self.shared.report(WriterFault::new(
                    FaultKind::ReplayFailure,
                    count,
                    format!("{:#}", exhausted.error),
                ));
                0
            }
        }
    }

    async fn run(mut self, mut records: RecordReceiver, mut control: ControlReceiver) {
        log_info!("batch writer running");
        let mut records_open = true;

        loop {
            let deadline = self.oldest.map(|oldest| oldest + self.max_flush_latency);

            tokio::select! {
                biased;

                command = control.recv() => {
                    self.drain_queued(&mut records).await;
                    match command {
                        Some(command) => {
                            if self.handle(command).await.is_break() {
                                break;
                            }
                        }
                        None => {
                            log_warn!("control channel closed without shutdown");
                            let _ = self.finish().await;
                            break;
                        }
                    }
                }
                record = records.recv(), if records_open => match record {
                    Some(record) => self.accept(record).await,
                    None => records_open = false,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    // Failures are parked and reported inside flush.
                    let _ = self.flush().await;
                }
            }
        }
    }

    async fn drain_queued(&mut self, records: &mut RecordReceiver) {
        for _ in 0..self.drain_limit {
            match records.try_recv() {
                Ok(record) => self.accept(record).await,
                Err(_) => break,
            }
        }
    }

    async fn accept(&mut self, record: EventRecord) {
        let now = Utc::now();
        let session = with_retries(&mut self.conn, &self.retry, "session start", |conn| {
            self.lifecycle.ensure_active(conn, now)
        })
        .await;

        let session_id = match session {
            Ok(session_id) => session_id,
            Err(exhausted) => {
                self.park(
                    vec![OverflowEntry {
                        session_id: None,
                        record,
                        parked_at: now,
                    }],
                    &exhausted.error,
                );
                return;
            }
        };

        if self.buffer.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.buffer.push(PendingRecord { session_id, record });

        if self.buffer.len() >= self.batch_size {
            let _ = self.flush().await;
        }
    }

    async fn flush(&mut self) -> Result<usize> {
        self.oldest = None;
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let batch = std::mem::take(&mut self.buffer);
        let records = batch.len();
        let now = Utc::now();
        let committed = with_retries(&mut self.conn, &self.retry, "batch commit", |conn| {
            commit_batch(conn, &batch, now)
        })
        .await;

        match committed {
            Ok(()) => {
                self.shared.counters.record_flush(records);
                log_debug!("committed batch of {records} records");
                Ok(records)
            }
            Err(exhausted) => {
                self.shared.counters.record_failed_flush();
                let parked_at = Utc::now();
                let entries: Vec<OverflowEntry> = batch
                    .into_iter()
                    .map(|pending| OverflowEntry {
                        session_id: Some(pending.session_id),
                        record: pending.record,
                        parked_at,
                    })
                    .collect();
                self.park(entries, &exhausted.error);
                Err(exhausted.into_error(records))
            }
        }
    }

    fn park(&self, entries: Vec<OverflowEntry>, cause: &anyhow::Error) {
        let records = entries.len();
        match self.overflow.append(&entries) {
            Ok(()) => {
                self.shared.counters.record_overflowed(records);
                log_error!(
                    "parked {records} records in {} after commit failure: {cause:#}",
                    self.overflow.path().display()
                );
                self.shared.report(WriterFault::new(
                    FaultKind::TransactionFailure,
                    records,
                    format!("{cause:#}"),
                ));
            }
            Err(err) => {
                self.shared.counters.record_overflow_lost(records);
                log_error!(
                    "lost {records} records: commit failed ({cause:#}) and overflow log failed ({err:#})"
                );
                self.shared.report(WriterFault::new(
                    FaultKind::OverflowFailure,
                    records,
                    format!("{cause:#}; overflow: {err:#}"),
                ));
            }
        }
    }

    async fn handle(&mut self, command: ControlCommand) -> ControlFlow<()> {
        match command {
            ControlCommand::Flush { reply } => {
                let _ = reply.send(self.flush().await);
            }
            ControlCommand::StartSession { reply } => {
                let now = Utc::now();
                let result = with_retries(&mut self.conn, &self.retry, "session start", |conn| {
                    self.lifecycle.start(conn, now)
                })
                .await
                .map_err(|exhausted| exhausted.into_error(0));
                let _ = reply.send(result);
            }
            ControlCommand::EndSession { reply } => {
                if let Err(err) = self.flush().await {
                    log_warn!("ending session after a failed flush: {err}");
                }
                let now = Utc::now();
                let result = with_retries(&mut self.conn, &self.retry, "session end", |conn| {
                    self.lifecycle.end(conn, now)
                })
                .await
                .map_err(|exhausted| exhausted.into_error(0));
                let _ = reply.send(result);
            }
            ControlCommand::MarkIntentsConsumed { ids, reply } => {
                let now = Utc::now();
                let result = with_retries(&mut self.conn, &self.retry, "intent consumption", |conn| {
                    let tx = conn.transaction()?;
                    let changed = mark_consumed(&tx, &ids, now)?;
                    tx.commit()?;
                    Ok(changed)
                })
                .await
                .map_err(|exhausted| exhausted.into_error(0));
                let _ = reply.send(result);
            }
            ControlCommand::MarkSessionSynced {
                session_id,
                cloud_session_id,
                reply,
            } => {
                let result = with_retries(&mut self.conn, &self.retry, "session sync marking", |conn| {
                    let tx = conn.transaction()?;
                    let session = mark_synced(&tx, session_id, &cloud_session_id)?;
                    tx.commit()?;
                    Ok(session)
                })
                .await
                .map_err(|exhausted| exhausted.into_error(0));
                let _ = reply.send(result);
            }
            ControlCommand::Cleanup {
                days_to_keep,
                reply,
            } => {
                let cutoff = cutoff_for(days_to_keep, Utc::now());
                let current = self.lifecycle.active_id();
                let result = with_retries(&mut self.conn, &self.retry, "retention cleanup", |conn| {
                    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    let report = delete_expired(&tx, cutoff, current)?;
                    tx.commit()?;
                    Ok(report)
                })
                .await
                .map_err(|exhausted| exhausted.into_error(0));
                if let Ok(report) = &result {
                    log_info!(
                        "retention ({days_to_keep} days): removed {} sessions and {} sync intents",
                        report.deleted_sessions,
                        report.deleted_sync_intents
                    );
                }
                let _ = reply.send(result);
            }
            ControlCommand::Shutdown { reply } => {
                let result = self.finish().await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Final flush plus a WAL checkpoint.
    async fn finish(&mut self) -> Result<usize> {
        let flushed = self.flush().await;
        match checkpoint(&self.conn) {
            Ok((0, log_frames, checkpointed)) => {
                log_debug!("shutdown checkpoint folded {checkpointed}/{log_frames} frames")
            }
            Ok((_, log_frames, checkpointed)) => log_warn!(
                "shutdown checkpoint incomplete ({checkpointed}/{log_frames} frames)"
            ),
            Err(err) => log_warn!("shutdown checkpoint failed: {err}"),
        }
        log_info!("batch writer stopped");
        flushed
    }
}

/// Degraded mode: answers commands with the storage error and retries the
/// open every `reopen_interval`. Returns `None` on shutdown.
async fn wait_for_storage(
    config: &StoreConfig,
    shared: &WriterShared,
    control: &mut ControlReceiver,
    mut last_error: StoreError,
) -> Option<BatchWriter> {
    let mut retry = tokio::time::interval(config.reopen_interval());
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
    retry.tick().await;

    loop {
        tokio::select! {
            command = control.recv() => match command {
                Some(ControlCommand::Shutdown { reply }) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(0));
                    }
                    log_info!("batch writer stopped while storage was unavailable");
                    return None;
                }
                Some(command) => command.reject(&last_error),
                None => return None,
            },
            _ = retry.tick() => match BatchWriter::open(config, shared.clone()).await {
                Ok((writer, report)) => {
                    log_info!(
                        "storage available again at {} ({} sessions reconciled, {} records replayed)",
                        config.db_path.display(),
                        report.reconciled.len(),
                        report.replayed
                    );
                    return Some(writer);
                }
                Err(err) => {
                    log_debug!("storage still unavailable: {err}");
                    last_error = err;
                }
            },
        }
    }
}

async fn writer_main(
    config: StoreConfig,
    records: RecordReceiver,
    mut control: ControlReceiver,
    shared: WriterShared,
    ready: std_mpsc::Sender<Result<WriterStartup>>,
) {
    let writer = match BatchWriter::open(&config, shared.clone()).await {
        Ok((writer, report)) => {
            let _ = ready.send(Ok(WriterStartup::Ready(report)));
            writer
        }
        Err(err @ StoreError::StorageUnavailable { .. }) => {
            log_error!("{err}; writer degraded, retrying every {:?}", config.reopen_interval());
            shared.report(WriterFault::new(FaultKind::StorageUnavailable, 0, err.to_string()));
            let _ = ready.send(Ok(WriterStartup::Degraded(err.duplicate())));
            match wait_for_storage(&config, &shared, &mut control, err).await {
                Some(writer) => writer,
                None => return,
            }
        }
        Err(err) => {
            log_error!("batch writer failed to start: {err}");
            let _ = ready.send(Err(err));
            return;
        }
    };

    writer.run(records, control).await;
}

/// Owns the writer thread. Dropping it performs the same shutdown as
/// [`WriterHandle::shutdown`], synchronously.
pub struct WriterHandle {
    control: WriterControl,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WriterHandle {
    pub fn control(&self) -> &WriterControl {
        &self.control
    }

    /// Flushes, checkpoints and joins the writer thread. Returns the number
    /// of records committed by the final flush.
    pub async fn shutdown(&self) -> Result<usize> {
        let Some(handle) = self.take_thread() else {
            return Ok(0);
        };
        let result = self.control.shutdown().await;
        if handle.join().is_err() {
            log_error!("batch writer thread panicked");
        }
        result
    }

    fn take_thread(&self) -> Option<JoinHandle<()>> {
        let mut guard = match self.thread.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take()
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.take_thread() {
            if self
                .control
                .sender
                .send(ControlCommand::Shutdown { reply: None })
                .is_err()
            {
                log_warn!("batch writer already gone at drop");
            }
            if handle.join().is_err() {
                log_error!("batch writer thread panicked");
            }
        }
    }
}

/// Starts the writer thread and waits until it has finished recovery (or
/// entered degraded mode).
pub fn spawn_batch_writer(
    config: StoreConfig,
    records: RecordReceiver,
    shared: WriterShared,
) -> Result<(WriterHandle, WriterStartup)> {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = std_mpsc::channel();

    let thread = thread::Builder::new()
        .name("blink-store-writer".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = ready_tx.send(Err(StoreError::Io(err)));
                    return;
                }
            };
            runtime.block_on(writer_main(config, records, control_rx, shared, ready_tx));
        })?;

    let startup = match ready_rx.recv() {
        Ok(Ok(startup)) => startup,
        Ok(Err(err)) => {
            let _ = thread.join();
            return Err(err);
        }
        Err(_) => {
            let _ = thread.join();
            return Err(StoreError::Other(anyhow!(
                "batch writer exited before reporting startup"
            )));
        }
    };

    Ok((
        WriterHandle {
            control: WriterControl { sender: control_tx },
            thread: Mutex::new(Some(thread)),
        },
        startup,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewBlink;
    use crate::db::repositories::events::blinks_for_session;
    use crate::db::repositories::sync_intents::pending_count;

    fn config(dir: &tempfile::TempDir) -> StoreConfig {
        let mut config = StoreConfig::with_db_path(dir.path().join("blinks.sqlite3"));
        config.batch_size = 4;
        config.retry_backoff_ms = 1;
        config.max_retries = 2;
        config
    }

    fn shared() -> (WriterShared, mpsc::UnboundedReceiver<WriterFault>) {
        let (faults, fault_rx) = mpsc::unbounded_channel();
        (
            WriterShared {
                counters: Arc::default(),
                faults,
                current: CurrentSession::new(),
            },
            fault_rx,
        )
    }

    fn blink(count: u32) -> EventRecord {
        EventRecord::Blink(NewBlink {
            timestamp: Utc::now(),
            blink_count: count,
            blink_rate: 10.0 + f64::from(count),
            eye_aspect_ratio: None,
        })
    }

    #[test]
    fn backoff_doubles_within_jitter() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_backoff: Duration::from_millis(50),
        };
        for _ in 0..20 {
            let first = policy.delay(1);
            let third = policy.delay(3);
            assert!(first >= Duration::from_millis(40) && first <= Duration::from_millis(60));
            assert!(third >= Duration::from_millis(160) && third <= Duration::from_millis(240));
        }
        assert!(policy.delay(30) <= MAX_BACKOFF.mul_f64(1.2));
    }

    #[tokio::test]
    async fn full_buffer_commits_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _faults) = shared();
        let (mut writer, _) = BatchWriter::open(&config(&dir), shared.clone()).await.unwrap();

        for count in 1..=3 {
            writer.accept(blink(count)).await;
        }
        assert_eq!(writer.buffer.len(), 3);
        assert_eq!(shared.counters.snapshot().committed, 0);

        writer.accept(blink(4)).await;
        assert!(writer.buffer.is_empty());
        assert_eq!(shared.counters.snapshot().committed, 4);

        let session_id = writer.lifecycle.active_id().unwrap();
        let session = load_session(&writer.conn, session_id).unwrap().unwrap();
        assert_eq!(session.total_blinks, 10);
        assert_eq!(session.max_blink_rate, 14.0);
        // one intent per record plus the session insert
        assert_eq!(pending_count(&writer.conn).unwrap(), 5);
    }

    #[tokio::test]
    async fn failed_batch_is_parked_then_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let (shared, mut faults) = shared();
        let (mut writer, _) = BatchWriter::open(&config, shared.clone()).await.unwrap();

        writer.accept(blink(1)).await;
        let session_id = writer.lifecycle.active_id().unwrap();
        writer
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_blinks BEFORE INSERT ON blink_events
                 BEGIN SELECT RAISE(ABORT, 'disk says no'); END;",
            )
            .unwrap();
        writer.accept(blink(2)).await;

        let err = writer.flush().await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::TransactionFailure { attempts: 3, records: 2, .. }
        ));
        let fault = faults.try_recv().unwrap();
        assert_eq!(fault.kind, FaultKind::TransactionFailure);
        assert_eq!(fault.records, 2);
        assert_eq!(writer.overflow.load().unwrap().len(), 2);
        assert_eq!(shared.counters.snapshot().overflowed, 2);

        writer
            .conn
            .execute_batch("DROP TRIGGER reject_blinks;")
            .unwrap();
        assert_eq!(writer.replay_overflow().await, 2);
        assert!(writer.overflow.load().unwrap().is_empty());

        let blinks = blinks_for_session(&writer.conn, session_id).unwrap();
        assert_eq!(
            blinks.iter().map(|b| b.blink_count).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn orphaned_overflow_lands_in_a_closed_recovery_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let overflow = OverflowLog::new(config.overflow_path());
        overflow
            .append(&[
                OverflowEntry {
                    session_id: None,
                    record: blink(3),
                    parked_at: Utc::now(),
                },
                OverflowEntry {
                    session_id: Some(4242),
                    record: blink(5),
                    parked_at: Utc::now(),
                },
            ])
            .unwrap();

        let (shared, _faults) = shared();
        let (writer, report) = BatchWriter::open(&config, shared).await.unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(writer.lifecycle.active_id(), None);

        let sessions = crate::db::repositories::sessions::recent_sessions(&writer.conn, 10, None).unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].is_open());
        assert_eq!(sessions[0].total_blinks, 8);
    }

    #[tokio::test]
    async fn unreadable_overflow_log_is_cleared_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        std::fs::write(config.overflow_path(), b"{\"sessionId\":1,\"rec").unwrap();

        let (shared, _faults) = shared();
        let (mut writer, report) = BatchWriter::open(&config, shared.clone()).await.unwrap();
        assert_eq!(report.replayed, 0);
        assert!(!config.overflow_path().exists());

        writer.accept(blink(1)).await;
        writer
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_blinks BEFORE INSERT ON blink_events
                 BEGIN SELECT RAISE(ABORT, 'disk says no'); END;",
            )
            .unwrap();
        assert!(writer.flush().await.is_err());
        assert_eq!(writer.overflow.load().unwrap().len(), 1);
        assert_eq!(shared.counters.snapshot().overflowed, 1);
    }
}
