pub mod event;
pub mod session;
pub mod sync_intent;

pub use event::{BlinkEvent, NewBlink, NewPerformanceSample, PerformanceSample};
pub use session::{BlinkSummary, PerformanceSummary, Session, SessionStats};
pub use sync_intent::{SyncAction, SyncIntent};
