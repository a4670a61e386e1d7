//! Pass lifecycle: state derivation, transitions and the tick driver.

pub mod clock;
pub mod orchestrator;
pub mod scheduler;
pub mod state;

pub use clock::{Clock, SystemClock};
pub use orchestrator::{Orchestrator, TeardownReport};
pub use scheduler::{PassScheduler, TickSummary};
pub use state::PassState;
