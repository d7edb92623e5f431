//! Background tasks.

pub mod reaper;

pub use reaper::{SweepReport, TimeoutReaper};
