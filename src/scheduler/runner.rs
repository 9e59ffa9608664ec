//! The cycle loop: plan phases, dispatch them on the pool, report, cool down.

use chrono::Utc;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use super::{CycleReport, CycleState, Job, JobOutcome, JobResult, Mode, RateWindow, StopSignal, PANIC_KIND};
use crate::acquire::{AcquireOutcome, Acquirer};
use crate::config::Config;
use crate::dedupe::FolderDeduplicator;
use crate::discovery::discover_image_folders;
use crate::error::HarvestError;
use crate::similarity::SimilarityEngine;
use crate::source::ImageSource;
use crate::subject::{Layout, Subject};

pub struct Scheduler {
    pool: rayon::ThreadPool,
    rate: RateWindow,
    acquirer: Acquirer,
    deduplicator: FolderDeduplicator,
    layout: Layout,
    extensions: Vec<String>,
    perpetual: bool,
    cooldown: Duration,
    state: CycleState,
    cycles_run: u64,
    last_report: Option<CycleReport>,
}

impl Scheduler {
    pub fn new(config: &Config, source: Arc<dyn ImageSource>) -> Result<Self, HarvestError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.scheduler.worker_pool_size.max(1))
            .thread_name(|i| format!("harvest-worker-{}", i))
            .build()
            .map_err(|e| HarvestError::Configuration(format!("failed to build worker pool: {}", e)))?;

        Ok(Self {
            pool,
            rate: RateWindow::new(config.scheduler.rate_limit, config.scheduler.rate_window()),
            acquirer: Acquirer::new(config, source),
            deduplicator: FolderDeduplicator::new(
                SimilarityEngine::from_config(&config.dedup),
                config.downloads.image_extensions.clone(),
                config.dedup.marker_suffix.clone(),
            ),
            layout: Layout::new(&config.downloads.root),
            extensions: config.downloads.image_extensions.clone(),
            perpetual: config.scheduler.perpetual,
            cooldown: config.scheduler.cooldown(),
            state: CycleState::Idle,
            cycles_run: 0,
            last_report: None,
        })
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn last_report(&self) -> Option<&CycleReport> {
        self.last_report.as_ref()
    }

    /// Jobs for one cycle, grouped into phases that run one after another.
    pub fn plan(&self, subjects: &[Subject], mode: Mode) -> Vec<Vec<Job>> {
        let dedupe = || -> Vec<Job> {
            subjects
                .iter()
                .map(|s| (s, self.layout.dir_for(s)))
                .filter(|(_, dir)| dir.is_dir())
                .map(|(s, dir)| Job::Deduplicate {
                    label: s.to_string(),
                    dir,
                })
                .collect()
        };
        let acquire = || -> Vec<Job> { subjects.iter().cloned().map(Job::Acquire).collect() };

        match mode {
            Mode::Dedupe => vec![dedupe()],
            Mode::Acquire => vec![acquire()],
            Mode::Both => vec![dedupe(), acquire()],
            Mode::Sweep => vec![discover_image_folders(self.layout.root(), &self.extensions)
                .into_iter()
                .map(|dir| Job::Deduplicate {
                    label: dir.display().to_string(),
                    dir,
                })
                .collect()],
        }
    }

    /// Run one cycle to completion. Individual job failures end up in the
    /// report, never as an early return.
    pub fn run_cycle(&mut self, subjects: &[Subject], mode: Mode) -> &CycleReport {
        self.cycles_run += 1;
        let started_at = Utc::now();
        let start = Instant::now();
        let mut outcomes = Vec::new();

        for (index, phase) in self.plan(subjects, mode).into_iter().enumerate() {
            tracing::info!(cycle = self.cycles_run, phase = index + 1, jobs = phase.len(), %mode, "Dispatching phase");
            outcomes.extend(self.run_phase(phase));
        }

        let report = CycleReport {
            cycle: self.cycles_run,
            mode,
            started_at,
            elapsed: start.elapsed(),
            outcomes,
        };

        tracing::info!(
            cycle = report.cycle,
            jobs = report.outcomes.len(),
            succeeded = report.succeeded(),
            partial = report.partial(),
            failed = report.failed(),
            failed_by_kind = ?report.failures_by_kind(),
            elapsed_secs = report.elapsed.as_secs_f64(),
            "Cycle complete"
        );
        for outcome in report.failures() {
            if let JobResult::Failed { kind, message } = &outcome.result {
                tracing::error!(
                    job = %outcome.label,
                    job_kind = outcome.kind.display_name(),
                    error_kind = kind,
                    error = %message,
                    "Job failed"
                );
            }
        }

        self.transition(CycleState::Idle);
        self.last_report.insert(report)
    }

    /// Run cycles until done: one cycle, or in perpetual mode until `stop` is
    /// raised. A raised stop lets the running cycle finish and cuts the
    /// cooldown short. Returns the number of cycles run.
    pub fn run(&mut self, subjects: &[Subject], mode: Mode, stop: &StopSignal) -> u64 {
        let mut cycles = 0;

        while !stop.is_stopped() {
            self.run_cycle(subjects, mode);
            cycles += 1;

            if !self.perpetual || stop.is_stopped() {
                break;
            }

            self.transition(CycleState::CooldownSleep);
            tracing::info!(cooldown_secs = self.cooldown.as_secs(), "Waiting before next cycle");
            if stop.wait_timeout(self.cooldown) {
                break;
            }
            self.transition(CycleState::Idle);
        }

        self.transition(CycleState::Stopped);
        tracing::info!(cycles, "Scheduler stopped");
        cycles
    }

    fn run_phase(&mut self, jobs: Vec<Job>) -> Vec<JobOutcome> {
        if jobs.is_empty() {
            return Vec::new();
        }

        self.transition(CycleState::Dispatching);
        let (tx, rx) = mpsc::channel();
        let rate = &mut self.rate;
        let state = &mut self.state;
        let acquirer = &self.acquirer;
        let deduplicator = &self.deduplicator;

        // Dispatch (and any rate-window sleep) stays on this thread so every
        // pool worker is free to run jobs. Returns once all jobs finished.
        self.pool.in_place_scope(move |scope| {
            for job in jobs {
                let dispatched_at = if job.uses_source() {
                    rate.admit()
                } else {
                    Instant::now()
                };
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let result = execute(&job, acquirer, deduplicator);
                    let outcome = JobOutcome {
                        label: job.label(),
                        kind: job.kind(),
                        dispatched_at,
                        elapsed: dispatched_at.elapsed(),
                        result,
                    };
                    // Receiver outlives the scope.
                    let _ = tx.send(outcome);
                });
            }
            tracing::debug!(from = ?*state, to = ?CycleState::AwaitingCompletion, "Cycle state");
            *state = CycleState::AwaitingCompletion;
        });

        rx.into_iter().collect()
    }

    fn transition(&mut self, next: CycleState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "Cycle state");
            self.state = next;
        }
    }
}

/// Run one job, containing both errors and panics.
fn execute(job: &Job, acquirer: &Acquirer, deduplicator: &FolderDeduplicator) -> JobResult {
    let run = || match job {
        Job::Acquire(subject) => match acquirer.acquire(subject) {
            Ok(AcquireOutcome::Skipped { .. }) => JobResult::Success,
            Ok(AcquireOutcome::Completed(report)) if report.errors.is_empty() => JobResult::Success,
            Ok(AcquireOutcome::Completed(report)) => JobResult::Partial(report.errors),
            Err(e) => e.into(),
        },
        Job::Deduplicate { dir, .. } => {
            let report = deduplicator.deduplicate(dir);
            if report.is_clean() {
                JobResult::Success
            } else {
                JobResult::Partial(report.errors)
            }
        }
    };

    panic::catch_unwind(AssertUnwindSafe(run)).unwrap_or_else(|payload| JobResult::Failed {
        kind: PANIC_KIND,
        message: format!("job panicked: {}", panic_message(&*payload)),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::discover_images;
    use crate::source::{SearchRequest, SourceImage};
    use crate::test_support::{resized, wave, write, ScriptedSource};
    use std::fs;
    use std::path::Path;
    use std::thread;
    use tempfile::tempdir;

    fn config(root: &Path) -> Config {
        let mut config = Config::default();
        config.downloads.root = root.to_path_buf();
        config.downloads.max_images_per_folder = 10;
        config.source.format = "png".to_string();
        config.scheduler.rate_limit = 100;
        config.scheduler.rate_window_ms = 100;
        config.scheduler.worker_pool_size = 4;
        config
    }

    fn subjects(n: usize) -> Vec<Subject> {
        (1..=n)
            .map(|i| Subject::new("Agaricus", &format!("species{}", i)).unwrap())
            .collect()
    }

    fn png_names(dir: &Path) -> Vec<String> {
        discover_images(dir, &["png".to_string()])
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_dispatch_respects_rate_window() {
        let window = Duration::from_millis(200);
        // Jobs may start a little after admission when the pool is busy.
        let slack = Duration::from_millis(60);

        for pool_size in [1, 4] {
            let tmp = tempdir().unwrap();
            let mut config = config(tmp.path());
            config.scheduler.rate_limit = 2;
            config.scheduler.rate_window_ms = 200;
            config.scheduler.worker_pool_size = pool_size;

            let source = Arc::new(ScriptedSource::new(vec![wave(1, 1, 32, 32)]));
            let mut scheduler = Scheduler::new(&config, source.clone()).unwrap();
            let report = scheduler.run_cycle(&subjects(5), Mode::Acquire);
            assert_eq!(report.succeeded(), 5, "pool {}", pool_size);

            let started = source.search_starts();
            assert_eq!(started.len(), 5);
            // No more than two searches begin inside any one window.
            for pair in 0..3 {
                let gap = started[pair + 2] - started[pair];
                assert!(gap + slack >= window, "pool {} gap {:?}", pool_size, gap);
            }
            // The first batch is not held back behind later dispatches.
            assert!(started[0] - first_dispatch(&report) < window, "pool {}", pool_size);
        }
    }

    fn first_dispatch(report: &CycleReport) -> Instant {
        report
            .outcomes
            .iter()
            .map(|o| o.dispatched_at)
            .min()
            .unwrap()
    }

    #[test]
    fn test_failing_job_does_not_stop_the_batch() {
        let tmp = tempdir().unwrap();
        let subjects = subjects(5);
        let source = Arc::new(
            ScriptedSource::new(vec![wave(1, 1, 32, 32), wave(2, 3, 32, 32)])
                .failing_for(subjects[2].query()),
        );
        let mut scheduler = Scheduler::new(&config(tmp.path()), source).unwrap();

        let report = scheduler.run_cycle(&subjects, Mode::Acquire);

        assert_eq!(report.outcomes.len(), 5);
        assert_eq!(report.succeeded(), 4);
        assert_eq!(report.failed(), 1);
        let failure = report.failures().next().unwrap();
        assert_eq!(failure.label, subjects[2].to_string());
        assert_eq!(report.failures_by_kind().get("adapter"), Some(&1));

        let layout = Layout::new(tmp.path());
        for (i, subject) in subjects.iter().enumerate() {
            let expected = if i == 2 { 0 } else { 2 };
            assert_eq!(png_names(&layout.dir_for(subject)).len(), expected);
        }
    }

    #[test]
    fn test_panicking_job_is_contained() {
        struct PanickySource;

        impl ImageSource for PanickySource {
            fn search(&self, request: &SearchRequest) -> Result<Vec<SourceImage>, HarvestError> {
                if request.query.ends_with("species2") {
                    panic!("source exploded");
                }
                fs::create_dir_all(&request.output_dir).unwrap();
                let local_path = request.output_dir.join("001_ok.png");
                write(&local_path, &wave(1, 2, 24, 24));
                Ok(vec![SourceImage {
                    source_url: "https://images.test/ok".to_string(),
                    local_path,
                }])
            }

            fn source_name(&self) -> &'static str {
                "panicky"
            }
        }

        let tmp = tempdir().unwrap();
        let mut scheduler = Scheduler::new(&config(tmp.path()), Arc::new(PanickySource)).unwrap();
        let report = scheduler.run_cycle(&subjects(3), Mode::Acquire);

        assert_eq!(report.succeeded(), 2);
        let failure = report.failures().next().unwrap();
        assert_eq!(failure.label, "Agaricus species2");
        assert!(matches!(
            &failure.result,
            JobResult::Failed { kind: PANIC_KIND, message } if message.contains("source exploded")
        ));
        assert_eq!(scheduler.state(), CycleState::Idle);
    }

    #[test]
    fn test_both_mode_dedupes_before_acquiring() {
        let tmp = tempdir().unwrap();
        let subjects = subjects(1);
        let dir = Layout::new(tmp.path()).dir_for(&subjects[0]);
        fs::create_dir_all(&dir).unwrap();
        write(&dir.join("a.png"), &wave(1, 1, 80, 80));
        write(&dir.join("b.png"), &resized(&wave(1, 1, 80, 80), 50, 50));

        let source = Arc::new(ScriptedSource::new(vec![
            resized(&wave(1, 1, 80, 80), 64, 64),
            wave(2, 3, 80, 80),
        ]));
        let mut scheduler = Scheduler::new(&config(tmp.path()), source).unwrap();
        let report = scheduler.run_cycle(&subjects, Mode::Both);

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(png_names(&dir), vec!["002_call1.png", "a__DD.png"]);
    }

    #[test]
    fn test_dedupe_mode_skips_missing_directories() {
        let tmp = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![wave(1, 1, 32, 32)]));
        let mut scheduler = Scheduler::new(&config(tmp.path()), source.clone()).unwrap();

        let report = scheduler.run_cycle(&subjects(3), Mode::Dedupe);
        assert!(report.outcomes.is_empty());
        assert_eq!(source.calls(), 0);
    }

    #[test]
    fn test_sweep_covers_every_image_folder() {
        let tmp = tempdir().unwrap();
        let first = tmp.path().join("Fungi").join("Amanita_muscaria");
        let second = tmp.path().join("Boletus_edulis");
        for dir in [&first, &second] {
            fs::create_dir_all(dir).unwrap();
            write(&dir.join("a.png"), &wave(2, 1, 60, 60));
            write(&dir.join("b.png"), &resized(&wave(2, 1, 60, 60), 40, 40));
        }

        let source = Arc::new(ScriptedSource::new(vec![]));
        let mut scheduler = Scheduler::new(&config(tmp.path()), source).unwrap();
        let report = scheduler.run_cycle(&[], Mode::Sweep);

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(png_names(&first), vec!["a__DD.png"]);
        assert_eq!(png_names(&second), vec!["a__DD.png"]);
    }

    #[test]
    fn test_single_cycle_when_not_perpetual() {
        let tmp = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![wave(1, 1, 32, 32)]));
        let mut scheduler = Scheduler::new(&config(tmp.path()), source.clone()).unwrap();

        let cycles = scheduler.run(&subjects(2), Mode::Acquire, &StopSignal::new());

        assert_eq!(cycles, 1);
        assert_eq!(source.calls(), 2);
        assert_eq!(scheduler.state(), CycleState::Stopped);
    }

    #[test]
    fn test_perpetual_runs_until_stopped() {
        let tmp = tempdir().unwrap();
        let mut config = config(tmp.path());
        config.scheduler.perpetual = true;
        config.scheduler.cooldown_seconds = 0;

        let stop = StopSignal::new();
        let trigger = stop.clone();
        let source = Arc::new(ScriptedSource::new(vec![wave(1, 1, 32, 32)]).on_search(move |call| {
            if call == 3 {
                trigger.stop();
            }
        }));
        let mut scheduler = Scheduler::new(&config, source.clone()).unwrap();

        let cycles = scheduler.run(&subjects(1), Mode::Acquire, &stop);

        // The cycle in flight when stop is raised still completes.
        assert_eq!(cycles, 3);
        assert_eq!(source.calls(), 3);
        assert_eq!(scheduler.last_report().unwrap().cycle, 3);
        assert_eq!(scheduler.state(), CycleState::Stopped);
    }

    #[test]
    fn test_stop_interrupts_cooldown() {
        let tmp = tempdir().unwrap();
        let mut config = config(tmp.path());
        config.scheduler.perpetual = true;
        config.scheduler.cooldown_seconds = 3600;

        let stop = StopSignal::new();
        let remote = stop.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            remote.stop();
        });

        let source = Arc::new(ScriptedSource::new(vec![wave(1, 1, 32, 32)]));
        let mut scheduler = Scheduler::new(&config, source).unwrap();
        let start = Instant::now();
        let cycles = scheduler.run(&subjects(1), Mode::Acquire, &stop);

        assert_eq!(cycles, 1);
        assert!(start.elapsed() < Duration::from_secs(60));
        stopper.join().unwrap();
    }

    #[test]
    fn test_stop_before_start_runs_nothing() {
        let tmp = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![wave(1, 1, 32, 32)]));
        let mut scheduler = Scheduler::new(&config(tmp.path()), source.clone()).unwrap();
        let stop = StopSignal::new();
        stop.stop();

        assert_eq!(scheduler.run(&subjects(2), Mode::Acquire, &stop), 0);
        assert_eq!(source.calls(), 0);
    }
}
