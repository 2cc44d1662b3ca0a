use std::sync::Arc;

use crate::db::{LazyDatabase, Session, SessionStats};
use crate::error::Result;
use crate::ingest::WriterControl;
use crate::session::CurrentSession;

/// Caller-facing side of the session lifecycle.
///
/// Transitions are executed by the batch writer, in order with the events
/// queued before them. Queries go through the read-only connection and see
/// committed data only.
#[derive(Clone)]
pub struct SessionManager {
    control: WriterControl,
    reader: Arc<LazyDatabase>,
    current: CurrentSession,
}

impl SessionManager {
    pub fn new(control: WriterControl, reader: Arc<LazyDatabase>, current: CurrentSession) -> Self {
        Self {
            control,
            reader,
            current,
        }
    }

    /// Starts a session, or returns the one already active in this process.
    pub async fn auto_create_session(&self) -> Result<Session> {
        self.control.start_session().await
    }

    /// Flushes pending events into the active session and closes it.
    pub async fn end_current_session(&self) -> Result<Option<Session>> {
        self.control.end_session().await
    }

    pub fn current_session_id(&self) -> Option<i64> {
        self.current.get()
    }

    pub async fn get_current_session(&self) -> Result<Option<Session>> {
        let Some(session_id) = self.current.get() else {
            return Ok(None);
        };
        self.get_session(session_id).await
    }

    pub async fn get_session(&self, session_id: i64) -> Result<Option<Session>> {
        Ok(self.reader.get().await?.get_session(session_id).await?)
    }

    pub async fn get_session_stats(&self, session_id: i64) -> Result<Option<SessionStats>> {
        Ok(self
            .reader
            .get()
            .await?
            .get_session_stats(session_id)
            .await?)
    }

    /// Newest first. `user_id` narrows the list to one user's sessions.
    pub async fn get_recent_sessions(
        &self,
        limit: usize,
        user_id: Option<&str>,
    ) -> Result<Vec<Session>> {
        Ok(self
            .reader
            .get()
            .await?
            .get_recent_sessions(limit, user_id.map(str::to_owned))
            .await?)
    }

    pub async fn mark_session_synced(
        &self,
        session_id: i64,
        cloud_session_id: impl Into<String>,
    ) -> Result<Option<Session>> {
        self.control
            .mark_session_synced(session_id, cloud_session_id.into())
            .await
    }
}
