pub mod connection;
pub mod engine;
pub(crate) mod helpers;
pub mod migrations;
pub mod models;
pub mod repositories;

pub use connection::{Database, LazyDatabase};
pub use models::{
    BlinkEvent, BlinkSummary, NewBlink, NewPerformanceSample, PerformanceSample,
    PerformanceSummary, Session, SessionStats, SyncAction, SyncIntent,
};
pub use repositories::RetentionReport;
