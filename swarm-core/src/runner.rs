mod executor;
mod gate;
mod pacer;
mod schedule;
mod signal;

pub(crate) use executor::{ScenarioRuntime, drive_scenario, run_vu};
pub use gate::IterationGate;
pub use pacer::{ArrivalClock, ArrivalPacer};
pub use schedule::RampingSchedule;
pub use signal::{RunControl, Signal, StopHandle};
