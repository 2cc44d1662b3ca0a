pub mod events;
pub mod retention;
pub mod sessions;
pub mod sync_intents;

pub use retention::RetentionReport;
