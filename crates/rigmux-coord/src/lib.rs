pub mod error;
pub mod gate;
pub mod index;
pub mod signal;

pub use error::CoordError;
pub use gate::{GateCoordinator, ParkReport, ResumeReport};
pub use index::{IndexEntry, SessionIndex};
pub use signal::{AwaitConfig, AwaitReport, SignalWaiter, effective_timeout};
