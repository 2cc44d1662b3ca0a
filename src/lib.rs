pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod sampler;
pub mod session;
pub mod store;
mod utils;

use std::path::Path;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

pub use config::{StoreConfig, UserIdentity};
pub use db::{
    BlinkEvent, BlinkSummary, NewBlink, NewPerformanceSample, PerformanceSample,
    PerformanceSummary, RetentionReport, Session, SessionStats, SyncAction, SyncIntent,
};
pub use error::{Result, StoreError};
pub use ingest::{EventRecord, FaultKind, IngestQueue, IngestStats, WriterFault};
pub use session::{SessionManager, SessionState};
pub use store::EventStore;
pub use utils::init_logging;

/// Environment variable naming the JSON config file used by [`run`].
pub const CONFIG_ENV: &str = "BLINK_STORE_CONFIG";

/// Runs the store as a standalone process: one session, performance
/// sampling until Ctrl-C, then session end, retention and a clean close.
pub fn run() -> anyhow::Result<()> {
    init_logging();

    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => StoreConfig::load(Path::new(&path))?,
        None => StoreConfig::default(),
    };

    log::info!("blink-store starting up...");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run_until_interrupted(config))
}

async fn run_until_interrupted(config: StoreConfig) -> anyhow::Result<()> {
    let sample_interval = config.sample_interval();
    let retention_days = config.retention_days;

    let store = EventStore::open(config).context("failed to open event store")?;
    let session = store.auto_create_session().await?;
    log::info!("tracking session {}", session.id);

    let cancel_token = CancellationToken::new();
    let sampler = sampler::spawn_sampler(store.ingest(), sample_interval, cancel_token.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    log::info!("interrupt received, shutting down");

    cancel_token.cancel();
    if let Err(err) = sampler.await {
        log::warn!("performance sampler ended abnormally: {err}");
    }

    if let Some(ended) = store.end_current_session().await? {
        log::info!(
            "session {} ended: {} blinks over {}s",
            ended.id,
            ended.total_blinks,
            ended.duration_secs
        );
    }

    let report = store.cleanup_old_data(retention_days).await?;
    if !report.is_empty() {
        log::info!(
            "retention removed {} sessions and {} sync intents",
            report.deleted_sessions,
            report.deleted_sync_intents
        );
    }

    store.close().await?;
    Ok(())
}
