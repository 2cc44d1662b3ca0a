use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const APP_DIR: &str = "blink-store";
const DB_FILE: &str = "blink_store.sqlite3";
const OVERFLOW_FILE: &str = "overflow.jsonl";

/// Identity stamped onto every session created by this process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    /// Where records that could not be committed are parked. Defaults to a
    /// file next to the database.
    pub overflow_path: Option<PathBuf>,
    pub batch_size: usize,
    pub max_flush_latency_ms: u64,
    pub queue_capacity: usize,
    pub retention_days: u32,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub reopen_interval_ms: u64,
    pub busy_timeout_ms: u64,
    pub sample_interval_ms: u64,
    pub user: Option<UserIdentity>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join(DB_FILE),
            overflow_path: None,
            batch_size: 50,
            max_flush_latency_ms: 2_000,
            queue_capacity: 10_000,
            retention_days: 30,
            max_retries: 3,
            retry_backoff_ms: 50,
            reopen_interval_ms: 5_000,
            busy_timeout_ms: 5_000,
            sample_interval_ms: 2_000,
            user: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl StoreConfig {
    /// Defaults rooted at `db_path`; mostly useful for tests and tools.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Reads a JSON config file. A missing file yields the defaults, a
    /// malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than zero");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than zero");
        }
        if self.max_flush_latency_ms == 0 {
            anyhow::bail!("max_flush_latency_ms must be greater than zero");
        }
        if self.reopen_interval_ms == 0 || self.sample_interval_ms == 0 {
            anyhow::bail!("reopen_interval_ms and sample_interval_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn overflow_path(&self) -> PathBuf {
        match &self.overflow_path {
            Some(path) => path.clone(),
            None => self
                .db_path
                .parent()
                .map(|dir| dir.join(OVERFLOW_FILE))
                .unwrap_or_else(|| PathBuf::from(OVERFLOW_FILE)),
        }
    }

    pub fn max_flush_latency(&self) -> Duration {
        Duration::from_millis(self.max_flush_latency_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn reopen_interval(&self) -> Duration {
        Duration::from_millis(self.reopen_interval_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}
