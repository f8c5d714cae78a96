//! Master controller: starts runs, watches channel counters for drain or
//! stall, cleans up after each run and re-triggers after a cooldown.

pub mod controller;
pub mod error;
pub mod poll;
pub mod state;

pub use controller::{MasterController, Phase};
pub use error::ControllerError;
pub use poll::{poll_until, sleep_or_shutdown, Probe};
pub use state::{Observation, RunState};
