use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::config::UserIdentity;
use crate::db::models::Session;
use crate::db::repositories::sessions::{
    close_session, insert_session, last_activity, load_session, open_sessions,
};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "state", content = "sessionId")]
pub enum SessionState {
    NoSession,
    Active(i64),
    Ended(i64),
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::NoSession
    }
}

/// Id of the session the writer is currently routing events to.
///
/// The writer is the only one that moves it; everyone else reads it without
/// locking. Row ids start at 1, so 0 encodes "no active session".
#[derive(Debug, Clone, Default)]
pub struct CurrentSession {
    id: Arc<AtomicI64>,
}

impl CurrentSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<i64> {
        match self.id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    fn set(&self, id: Option<i64>) {
        self.id.store(id.unwrap_or(0), Ordering::Release);
    }
}

/// Session state machine driven by the batch writer on its own connection.
///
/// Every transition commits before the in-memory state moves, so a failed
/// transaction leaves both the database and the state untouched.
pub struct SessionLifecycle {
    state: SessionState,
    current: CurrentSession,
    user: Option<UserIdentity>,
}

impl SessionLifecycle {
    pub fn new(current: CurrentSession, user: Option<UserIdentity>) -> Self {
        current.set(None);
        Self {
            state: SessionState::NoSession,
            current,
            user,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn active_id(&self) -> Option<i64> {
        match self.state {
            SessionState::Active(id) => Some(id),
            _ => None,
        }
    }

    pub fn user(&self) -> Option<&UserIdentity> {
        self.user.as_ref()
    }

    /// Closes every session left open by a previous process. The synthesized
    /// end is the last recorded event, or the start when nothing was recorded.
    pub fn reconcile(&mut self, conn: &mut Connection) -> Result<Vec<Session>> {
        if let Some(id) = self.active_id() {
            return Err(anyhow!(
                "reconciliation requested while session {id} is active"
            ));
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let dangling = open_sessions(&tx)?;
        let mut closed = Vec::with_capacity(dangling.len());
        for session in dangling {
            let ended_at = last_activity(&tx, session.id)?
                .unwrap_or(session.start_time)
                .max(session.start_time);
            closed.push(close_session(&tx, session.id, ended_at)?);
        }
        tx.commit()?;

        for session in &closed {
            log_warn!(
                "closed dangling session {} (started {}, {} blinks)",
                session.id,
                session.start_time,
                session.total_blinks
            );
        }
        Ok(closed)
    }

    /// Returns the active session, or starts a new one.
    pub fn start(&mut self, conn: &mut Connection, now: DateTime<Utc>) -> Result<Session> {
        if let Some(id) = self.active_id() {
            if let Some(session) = load_session(conn, id)? {
                return Ok(session);
            }
            log_warn!("active session {id} disappeared from storage; starting a new one");
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let session = insert_session(&tx, now, self.user.as_ref())?;
        tx.commit()?;

        self.transition(SessionState::Active(session.id));
        log_info!("session {} started", session.id);
        Ok(session)
    }

    /// Id to route a dequeued record to, starting a session when none is active.
    pub fn ensure_active(&mut self, conn: &mut Connection, now: DateTime<Utc>) -> Result<i64> {
        match self.active_id() {
            Some(id) => Ok(id),
            None => Ok(self.start(conn, now)?.id),
        }
    }

    /// Finalizes the active session. `None` when nothing was active.
    pub fn end(&mut self, conn: &mut Connection, now: DateTime<Utc>) -> Result<Option<Session>> {
        let Some(id) = self.active_id() else {
            return Ok(None);
        };

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let session = close_session(&tx, id, now)?;
        tx.commit()?;

        self.transition(SessionState::Ended(id));
        log_info!(
            "session {} ended after {}s with {} blinks",
            session.id,
            session.duration_secs,
            session.total_blinks
        );
        Ok(Some(session))
    }

    fn transition(&mut self, next: SessionState) {
        self.state = next;
        self.current.set(self.active_id());
    }
}
