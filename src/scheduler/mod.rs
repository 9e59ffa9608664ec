//! Batch scheduling of dedupe and acquisition jobs.
//!
//! A cycle runs one or two phases of jobs on a fixed-size worker pool. Jobs
//! that hit the image source are admitted through a [`RateWindow`]; every
//! job's failure is captured in its [`JobOutcome`] instead of aborting the
//! batch.

pub mod rate;
pub mod runner;
pub mod stop;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::HarvestError;
use crate::subject::Subject;

pub use rate::RateWindow;
pub use runner::Scheduler;
pub use stop::StopSignal;

/// What a cycle does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Dedupe the existing directories of listed subjects.
    Dedupe,
    /// Fetch new images for listed subjects.
    Acquire,
    /// Dedupe phase, then acquire phase.
    Both,
    /// Dedupe every image folder under the downloads root.
    Sweep,
}

impl Mode {
    pub fn uses_subjects(&self) -> bool {
        !matches!(self, Mode::Sweep)
    }
}

impl FromStr for Mode {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dedupe" => Ok(Mode::Dedupe),
            "acquire" => Ok(Mode::Acquire),
            "both" => Ok(Mode::Both),
            "sweep" => Ok(Mode::Sweep),
            other => Err(HarvestError::Configuration(format!(
                "unknown mode {:?} (expected dedupe, acquire, both or sweep)",
                other
            ))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Dedupe => "dedupe",
            Mode::Acquire => "acquire",
            Mode::Both => "both",
            Mode::Sweep => "sweep",
        })
    }
}

/// The unit of work handed to the pool.
#[derive(Debug, Clone)]
pub enum Job {
    Deduplicate { label: String, dir: PathBuf },
    Acquire(Subject),
}

impl Job {
    pub fn label(&self) -> String {
        match self {
            Job::Deduplicate { label, .. } => label.clone(),
            Job::Acquire(subject) => subject.to_string(),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::Deduplicate { .. } => JobKind::Deduplicate,
            Job::Acquire(_) => JobKind::Acquire,
        }
    }

    /// Whether the job calls the external source and so counts against the
    /// rate limit.
    pub fn uses_source(&self) -> bool {
        matches!(self, Job::Acquire(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Deduplicate,
    Acquire,
}

impl JobKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            JobKind::Deduplicate => "dedupe",
            JobKind::Acquire => "acquire",
        }
    }
}

/// Kind label for a job that panicked instead of returning an error.
pub const PANIC_KIND: &str = "panic";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    /// Finished, but some images could not be handled.
    Partial(Vec<String>),
    /// `kind` is [`HarvestError::kind`] or [`PANIC_KIND`].
    Failed { kind: &'static str, message: String },
}

impl From<HarvestError> for JobResult {
    fn from(error: HarvestError) -> Self {
        JobResult::Failed {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub label: String,
    pub kind: JobKind,
    pub dispatched_at: Instant,
    pub elapsed: Duration,
    pub result: JobResult,
}

impl JobOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.result, JobResult::Failed { .. })
    }
}

/// Position in the per-cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Dispatching,
    AwaitingCompletion,
    CooldownSleep,
    /// Terminal: no further cycle will start.
    Stopped,
}

/// Everything that happened in one cycle, in completion order.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub outcomes: Vec<JobOutcome>,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.count(|r| matches!(r, JobResult::Success))
    }

    pub fn partial(&self) -> usize {
        self.count(|r| matches!(r, JobResult::Partial(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|r| matches!(r, JobResult::Failed { .. }))
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }

    /// Failed jobs counted per error kind.
    pub fn failures_by_kind(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for outcome in self.failures() {
            if let JobResult::Failed { kind, .. } = &outcome.result {
                *counts.entry(*kind).or_insert(0) += 1;
            }
        }
        counts
    }

    fn count(&self, pred: impl Fn(&JobResult) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.result)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("both".parse::<Mode>().unwrap(), Mode::Both);
        assert_eq!("SWEEP".parse::<Mode>().unwrap(), Mode::Sweep);
        assert!(matches!(
            "everything".parse::<Mode>(),
            Err(HarvestError::Configuration(_))
        ));
        assert_eq!(Mode::Dedupe.to_string(), "dedupe");
        assert!(!Mode::Sweep.uses_subjects());
    }

    #[test]
    fn test_only_acquisition_uses_source() {
        let subject = Subject::new("Amanita", "muscaria").unwrap();
        let acquire = Job::Acquire(subject);
        let dedupe = Job::Deduplicate {
            label: "Amanita muscaria".to_string(),
            dir: PathBuf::from("downloads/Amanita_muscaria"),
        };

        assert!(acquire.uses_source());
        assert!(!dedupe.uses_source());
        assert_eq!(acquire.label(), dedupe.label());
        assert_eq!(acquire.kind().display_name(), "acquire");
    }

    #[test]
    fn test_report_counts() {
        let outcome = |result| JobOutcome {
            label: "x".to_string(),
            kind: JobKind::Acquire,
            dispatched_at: Instant::now(),
            elapsed: Duration::ZERO,
            result,
        };
        let report = CycleReport {
            cycle: 1,
            mode: Mode::Acquire,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            outcomes: vec![
                outcome(JobResult::Success),
                outcome(JobResult::Partial(vec!["bad".to_string()])),
                outcome(HarvestError::adapter("Amanita muscaria", "HTTP 503").into()),
                outcome(JobResult::Success),
                outcome(HarvestError::adapter("Boletus edulis", "HTTP 429").into()),
                outcome(JobResult::Failed {
                    kind: PANIC_KIND,
                    message: "job panicked: boom".to_string(),
                }),
            ],
        };

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.partial(), 1);
        assert_eq!(report.failed(), 3);
        assert_eq!(report.failures().count(), 3);
        assert_eq!(
            report.failures_by_kind(),
            BTreeMap::from([("adapter", 2), (PANIC_KIND, 1)])
        );
    }
}
