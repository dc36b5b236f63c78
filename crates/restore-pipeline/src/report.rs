//! Post-run artifact verification and the batch report.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::{BatchEntry, SetupFailure};
use crate::diagnostics::{StageRecord, duration_serde};
use crate::job::{PipelineJob, StageFailure};
use crate::stage::Stage;

/// Outcome of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    /// The upscaled page the job restored.
    pub upscayl_file: PathBuf,
    /// The final destination.
    pub dest_file: PathBuf,
    /// Whether anything went wrong.
    pub failed: bool,
    /// Stage errors and missing artifacts, in detection order.
    pub failures: Vec<StageFailure>,
    /// Timing of every stage call.
    pub stages: Vec<StageRecord>,
}

impl From<&PipelineJob> for JobReport {
    fn from(job: &PipelineJob) -> Self {
        Self {
            upscayl_file: job.upscayl_file().to_path_buf(),
            dest_file: job.dest_file().to_path_buf(),
            failed: job.failed(),
            failures: job.failures().to_vec(),
            stages: job.records().to_vec(),
        }
    }
}

/// Outcome of a whole batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// One report per job that ran, in batch order.
    pub jobs: Vec<JobReport>,
    /// Entries skipped because their destination already existed.
    pub skipped: Vec<BatchEntry>,
    /// Entries that never became jobs.
    pub setup_failures: Vec<SetupFailure>,
    /// Wall-clock time of the scheduled run (seconds).
    #[serde(with = "duration_serde")]
    pub elapsed: Duration,
}

impl BatchReport {
    /// `true` when every job ran cleanly and every entry could be set up.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.setup_failures.is_empty() && self.jobs.iter().all(|j| !j.failed)
    }

    /// Number of jobs with at least one failure.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.failed).count()
    }

    /// Failed jobs, in batch order.
    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(|j| j.failed)
    }
}

/// Verify that every enabled stage of every job left its artifact on
/// disk, and summarize the batch.
///
/// A missing artifact marks its job failed even if the stage call
/// itself reported success. One error line is logged per missing
/// artifact, and one summary line per failed job.
pub fn check_for_errors(jobs: &mut [PipelineJob]) -> BatchReport {
    for job in jobs.iter_mut() {
        let missing: Vec<(Stage, PathBuf)> = job
            .definition()
            .enabled()
            .map(|stage| (stage, job.artifacts().output(stage).to_path_buf()))
            .filter(|(_, path)| !path.exists())
            .collect();

        for (stage, path) in missing {
            tracing::error!(
                stage = stage.name(),
                "Could not find output artifact \"{}\"",
                path.display()
            );
            job.record_missing_artifact(stage, &path);
        }

        if job.failed() {
            tracing::error!(
                failures = job.failures().len(),
                "Errors occurred while processing \"{}\"",
                job.upscayl_file().display()
            );
        }
    }

    BatchReport {
        jobs: jobs.iter().map(JobReport::from).collect(),
        ..BatchReport::default()
    }
}
