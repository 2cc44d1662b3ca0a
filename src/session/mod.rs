mod lifecycle;
mod manager;

pub use lifecycle::{CurrentSession, SessionLifecycle, SessionState};
pub use manager::SessionManager;
