//! Ordered phases of independent jobs, run on a dedicated rayon pool.
//!
//! A job declares the files it produces; when all of them already exist the
//! job is skipped, so re-running a plan only redoes missing work.
use std::fmt;
use std::path::PathBuf;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{EcocalcError, Result};

type JobFn = Box<dyn FnOnce() -> Result<()> + Send>;

pub struct Job {
    pub name: String,
    pub targets: Vec<PathBuf>,
    run: JobFn,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        targets: Vec<PathBuf>,
        run: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Self {
        Self { name: name.into(), targets, run: Box::new(run) }
    }

    fn is_complete(&self) -> bool {
        !self.targets.is_empty() && self.targets.iter().all(|t| t.exists())
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("name", &self.name).field("targets", &self.targets).finish()
    }
}

#[derive(Debug, Default)]
pub struct Phase {
    pub name: String,
    jobs: Vec<Job>,
}

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), jobs: Vec::new() }
    }

    pub fn job(mut self, job: Job) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn push(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: String,
    pub ran: Vec<String>,
    pub skipped: Vec<String>,
}

enum Outcome {
    Ran(String),
    Skipped(String),
    Failed(String, EcocalcError),
}

pub struct Runner {
    pool: rayon::ThreadPool,
}

impl Runner {
    /// `n_workers <= 0` uses every available CPU.
    pub fn new(n_workers: i32) -> Result<Self> {
        let threads = usize::try_from(n_workers).unwrap_or(0);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ecocalc-worker-{i}"))
            .build()
            .map_err(|e| EcocalcError::InvalidArgument(format!("cannot build worker pool: {e}")))?;
        debug!(threads = pool.current_num_threads(), "worker pool ready");
        Ok(Self { pool })
    }

    pub fn n_workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run every job of `phase` in parallel and wait for all of them. The
    /// first failure, in job order, is returned once the phase has drained.
    pub fn run_phase(&self, phase: Phase) -> Result<PhaseReport> {
        info!(phase = %phase.name, jobs = phase.jobs.len(), "starting phase");
        let outcomes: Vec<Outcome> = self.pool.install(|| {
            phase
                .jobs
                .into_par_iter()
                .map(|job| {
                    if job.is_complete() {
                        debug!(job = %job.name, "targets exist, skipping");
                        return Outcome::Skipped(job.name);
                    }
                    debug!(job = %job.name, "running");
                    match (job.run)() {
                        Ok(()) => Outcome::Ran(job.name),
                        Err(e) => {
                            warn!(job = %job.name, error = %e, "job failed");
                            Outcome::Failed(job.name, e)
                        }
                    }
                })
                .collect()
        });

        let mut report = PhaseReport { phase: phase.name, ..Default::default() };
        let mut failure = None;
        for outcome in outcomes {
            match outcome {
                Outcome::Ran(name) => report.ran.push(name),
                Outcome::Skipped(name) => report.skipped.push(name),
                Outcome::Failed(job, source) => {
                    if failure.is_none() {
                        failure = Some(EcocalcError::JobFailed { job, source: Box::new(source) });
                    }
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        info!(
            phase = %report.phase,
            ran = report.ran.len(),
            skipped = report.skipped.len(),
            "phase complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_all_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut phase = Phase::new("count");
        for i in 0..8 {
            let c = Arc::clone(&counter);
            phase.push(Job::new(format!("job {i}"), vec![], move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        let report = Runner::new(2).unwrap().run_phase(phase).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert_eq!(report.ran.len(), 8);
    }

    #[test]
    fn existing_targets_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let done = dir.path().join("done.tif");
        fs::write(&done, b"x").unwrap();
        let todo = dir.path().join("todo.tif");
        let todo_clone = todo.clone();

        let phase = Phase::new("p")
            .job(Job::new("done", vec![done], || panic!("should be skipped")))
            .job(Job::new("todo", vec![todo.clone()], move || {
                fs::write(&todo_clone, b"y")?;
                Ok(())
            }));
        let report = Runner::new(1).unwrap().run_phase(phase).unwrap();
        assert_eq!(report.skipped, vec!["done".to_string()]);
        assert_eq!(report.ran, vec!["todo".to_string()]);
        assert!(todo.exists());
    }

    #[test]
    fn failure_waits_for_other_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let phase = Phase::new("p")
            .job(Job::new("bad", vec![], || Err(EcocalcError::NoValidPixels)))
            .job(Job::new("good", vec![], move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        let err = Runner::new(2).unwrap().run_phase(phase).unwrap_err();
        assert!(matches!(err, EcocalcError::JobFailed { ref job, .. } if job == "bad"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_positive_workers_means_all_cpus() {
        assert!(Runner::new(-1).unwrap().n_workers() >= 1);
        assert_eq!(Runner::new(3).unwrap().n_workers(), 3);
    }
}
