use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Insert,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Insert => "insert",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }
}

/// A pending mutation for the external sync agent. `consumed_at` is set by
/// the agent once it has propagated the change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncIntent {
    pub id: i64,
    pub table_name: String,
    pub record_id: i64,
    pub action: SyncAction,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}
