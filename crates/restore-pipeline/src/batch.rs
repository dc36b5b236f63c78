//! Turning (source, upscaled, destination) triples into a scheduled batch.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::job::{JobSettings, PipelineJob};
use crate::report::{self, BatchReport};
use crate::scheduler::Scheduler;
use crate::types::PipelineError;

/// One page to restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    /// The original scanned page.
    pub srce: PathBuf,
    /// Its super-resolution upscaled copy.
    pub upscayl: PathBuf,
    /// Where the restored page goes.
    pub dest: PathBuf,
}

/// An entry that could not become a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupFailure {
    /// The rejected entry.
    pub entry: BatchEntry,
    /// Why it was rejected.
    pub reason: String,
}

/// Jobs ready to schedule, plus the entries that were left out.
#[derive(Debug, Default)]
pub struct BatchPlan {
    /// Jobs in entry order.
    pub jobs: Vec<PipelineJob>,
    /// Entries whose destination already existed.
    pub skipped: Vec<BatchEntry>,
    /// Entries whose inputs failed validation.
    pub setup_failures: Vec<SetupFailure>,
}

impl BatchPlan {
    /// `true` if there is nothing to schedule.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Build jobs for `entries`, in order.
///
/// An entry whose destination already exists is skipped with a warning
/// and never touched. An entry that fails validation is logged and
/// recorded; it does not stop the others. So is an entry whose scratch
/// files or destination would collide with an earlier job's: the first
/// entry keeps the paths and the later one never runs.
pub fn plan(entries: impl IntoIterator<Item = BatchEntry>, settings: &JobSettings) -> BatchPlan {
    let mut plan = BatchPlan::default();
    let mut work_stems = HashSet::new();
    let mut dests = HashSet::new();
    for entry in entries {
        if entry.dest.exists() {
            tracing::warn!("Dest file exists - skipping: \"{}\"", entry.dest.display());
            plan.skipped.push(entry);
            continue;
        }
        let reason = match PipelineJob::new(&entry, settings) {
            Ok(job) => match collision(&job, &work_stems, &dests) {
                None => {
                    work_stems.insert(job.artifacts().work_stem().to_string());
                    dests.insert(job.dest_file().to_path_buf());
                    plan.jobs.push(job);
                    continue;
                }
                Some(reason) => reason,
            },
            Err(err) => err.to_string(),
        };
        tracing::error!(upscayl = %entry.upscayl.display(), %reason, "cannot restore page");
        plan.setup_failures.push(SetupFailure { entry, reason });
    }
    tracing::info!(
        jobs = plan.jobs.len(),
        skipped = plan.skipped.len(),
        rejected = plan.setup_failures.len(),
        "planned batch"
    );
    plan
}

/// Why `job` cannot share a batch with the jobs already planned, if it
/// cannot.
fn collision(
    job: &PipelineJob,
    work_stems: &HashSet<String>,
    dests: &HashSet<PathBuf>,
) -> Option<String> {
    let stem = job.artifacts().work_stem();
    if work_stems.contains(stem) {
        return Some(format!(
            "scratch name \"{stem}\" is already used by another page in this batch"
        ));
    }
    let dest = job.dest_file();
    if dests.contains(dest) {
        return Some(format!(
            "dest file \"{}\" is already written by another page in this batch",
            dest.display()
        ));
    }
    None
}

/// Schedule every job of `plan`, then verify artifacts and report.
///
/// # Errors
///
/// Returns any scheduler error (see [`Scheduler::run`]). Stage failures
/// are not errors here; they show up in the report.
pub fn run(plan: &mut BatchPlan, scheduler: &Scheduler) -> Result<BatchReport, PipelineError> {
    let start = Instant::now();
    scheduler.run(&mut plan.jobs)?;
    let elapsed = start.elapsed();
    tracing::info!(
        "Time taken to restore all {} files: {}s",
        plan.jobs.len(),
        elapsed.as_secs()
    );

    let mut report = report::check_for_errors(&mut plan.jobs);
    report.skipped.clone_from(&plan.skipped);
    report.setup_failures.clone_from(&plan.setup_failures);
    report.elapsed = elapsed;
    Ok(report)
}
