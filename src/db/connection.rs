use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{error, info};
use rusqlite::Connection;
use tokio::sync::{oneshot, OnceCell};

use crate::db::engine::open_read_connection;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to reader thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join reader thread: {join_err:?}");
            }
        }
    }
}

/// Read-only query handle. Owns one read-only connection on a dedicated
/// thread so that queries never contend with the writer's connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn open_read_only(db_path: PathBuf, busy_timeout: Duration) -> crate::Result<Self> {
        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<crate::Result<()>>();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("blink-store-reader".into())
            .spawn(move || {
                let mut conn = match open_read_connection(&path_for_thread, busy_timeout) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                if ready_tx.send(Ok(())).is_err() {
                    error!("Reader initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Reader thread shutting down");
            })
            .context("failed to spawn database reader thread")?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("reader thread exited before signaling readiness"))??;

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to reader thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("reader thread terminated unexpectedly"))?
    }
}

/// Opens the read-only handle on first use. A failed open is not cached, so
/// queries keep retrying while the database file is unavailable.
pub struct LazyDatabase {
    db_path: PathBuf,
    busy_timeout: Duration,
    cell: OnceCell<Database>,
}

impl LazyDatabase {
    pub fn new(db_path: PathBuf, busy_timeout: Duration) -> Self {
        Self {
            db_path,
            busy_timeout,
            cell: OnceCell::new(),
        }
    }

    pub async fn get(&self) -> crate::Result<&Database> {
        self.cell
            .get_or_try_init(|| async {
                Database::open_read_only(self.db_path.clone(), self.busy_timeout)
            })
            .await
    }
}
