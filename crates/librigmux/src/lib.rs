pub mod beacon;
pub mod control;
pub mod error;
pub mod procs;
pub mod session;
pub mod stale;

pub use beacon::{Beacon, BeaconTopic};
pub use control::{SessionControl, Tmux};
pub use error::SessionError;
pub use session::{
    EnsureOutcome, EnsureReport, LaunchSpec, SessionConfig, SessionLifecycleManager, SessionState,
};
