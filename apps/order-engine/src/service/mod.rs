//! Service composition: the runner daemon and the signal executor.

mod runner;
mod signals;

pub use runner::ServiceRunner;
pub use signals::{EventOutcome, SignalExecutor};
