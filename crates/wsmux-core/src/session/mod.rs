//! Session identity and lifecycle types.

mod id;
mod state;

pub use id::{SessionId, SessionKind};
pub use state::{RunnerMeta, SessionInfo, SessionSpec, SessionState};
