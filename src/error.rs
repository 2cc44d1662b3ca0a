//! Error types shared by the store facade, the ingestion queue and the writer.
//!
//! Producer-facing calls (`log_blink`, `log_performance`) never surface these;
//! they turn failures into drop counters. Everything else returns
//! [`StoreError`].

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The bounded ingestion queue has no free slot; the record was not queued.
    #[error("ingestion queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The writer thread is gone and can no longer receive records.
    #[error("ingestion queue closed")]
    QueueClosed,

    /// A batch could not be committed after every retry.
    #[error("transaction failed after {attempts} attempts ({records} records): {source}")]
    TransactionFailure {
        attempts: u32,
        records: usize,
        #[source]
        source: anyhow::Error,
    },

    /// The database file cannot be opened or initialized.
    #[error("storage unavailable at {}: {reason}", path.display())]
    StorageUnavailable { path: PathBuf, reason: String },

    /// The database or its write-ahead log failed the startup check.
    #[error("recovery failed: {reason}")]
    RecoveryFailure { reason: String },

    /// The writer thread exited before answering a command.
    #[error("writer thread terminated unexpectedly")]
    WriterGone,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// Rebuilds an error for a second recipient. Wrapped sources are flattened
    /// into their message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::QueueFull { capacity } => Self::QueueFull {
                capacity: *capacity,
            },
            Self::QueueClosed => Self::QueueClosed,
            Self::StorageUnavailable { path, reason } => Self::StorageUnavailable {
                path: path.clone(),
                reason: reason.clone(),
            },
            Self::RecoveryFailure { reason } => Self::RecoveryFailure {
                reason: reason.clone(),
            },
            Self::WriterGone => Self::WriterGone,
            Self::Config(reason) => Self::Config(reason.clone()),
            other => Self::Other(anyhow::anyhow!("{other}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
