//! Image acquisition and near-duplicate removal per subject.

pub mod acquire;
pub mod config;
pub mod dedupe;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod similarity;
pub mod source;
pub mod subject;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::HarvestError;
pub use scheduler::{CycleReport, Mode, Scheduler, StopSignal};
pub use subject::Subject;
