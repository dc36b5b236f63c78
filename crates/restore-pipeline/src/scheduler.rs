//! Phase-barrier scheduling of a batch of jobs.
//!
//! The [`Scheduler`] runs phase 1 for every job, waits for all of them,
//! then phase 2, and so on. Each phase gets a fresh bounded pool sized by
//! [`PhasePolicy`], so memory-heavy phases can run with fewer workers
//! than cheap ones. Within a phase, jobs are picked up in batch order.

use std::fmt;
use std::sync::mpsc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::job::PipelineJob;
use crate::memory::{self, MemoryTiers};
use crate::stage::Phase;
use crate::types::PipelineError;

// ───────────────────────────── PhasePolicy ───────────────────────────

/// Worker counts for each phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhasePolicy {
    /// Phase 1 workers.
    pub prefilter: usize,
    /// Phase 2 workers.
    pub smooth: usize,
    /// Phase 3 workers.
    pub trace: usize,
    /// Phase 4 workers.
    pub composite: usize,
}

impl PhasePolicy {
    /// Default phase 1 concurrency.
    pub const DEFAULT_PREFILTER: usize = 10;
    /// Default phase 3 concurrency.
    pub const DEFAULT_TRACE: usize = 10;
    /// Default phase 4 concurrency.
    pub const DEFAULT_COMPOSITE: usize = 1;

    /// Default counts with phase 2 sized for a host of `total_bytes`.
    #[must_use]
    pub const fn for_total_memory(total_bytes: u64, tiers: &MemoryTiers) -> Self {
        Self {
            prefilter: Self::DEFAULT_PREFILTER,
            smooth: tiers.workers_for(total_bytes),
            trace: Self::DEFAULT_TRACE,
            composite: Self::DEFAULT_COMPOSITE,
        }
    }

    /// Default counts with phase 2 sized for this host.
    #[must_use]
    pub fn detect(tiers: &MemoryTiers) -> Self {
        let total = memory::total_memory_bytes();
        let policy = Self::for_total_memory(total, tiers);
        tracing::debug!(
            total_memory_bytes = total,
            smooth_workers = policy.smooth,
            "sized smoothing phase from host memory"
        );
        policy
    }

    /// The same worker count for every phase.
    #[must_use]
    pub const fn uniform(workers: usize) -> Self {
        Self {
            prefilter: workers,
            smooth: workers,
            trace: workers,
            composite: workers,
        }
    }

    /// Worker count for `phase`.
    #[must_use]
    pub const fn workers(&self, phase: Phase) -> usize {
        match phase {
            Phase::Prefilter => self.prefilter,
            Phase::Smooth => self.smooth,
            Phase::Trace => self.trace,
            Phase::Composite => self.composite,
        }
    }

    /// Replace the worker count for `phase`.
    #[must_use]
    pub const fn with_workers(mut self, phase: Phase, workers: usize) -> Self {
        match phase {
            Phase::Prefilter => self.prefilter = workers,
            Phase::Smooth => self.smooth = workers,
            Phase::Trace => self.trace = workers,
            Phase::Composite => self.composite = workers,
        }
        self
    }

    /// Reject zero worker counts.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first phase
    /// with zero workers.
    pub fn validate(&self) -> Result<(), PipelineError> {
        match Phase::ALL.into_iter().find(|&p| self.workers(p) == 0) {
            Some(phase) => Err(PipelineError::InvalidConfig(format!(
                "{phase} needs at least one worker"
            ))),
            None => Ok(()),
        }
    }
}

impl Default for PhasePolicy {
    fn default() -> Self {
        Self {
            prefilter: Self::DEFAULT_PREFILTER,
            smooth: MemoryTiers::DEFAULT_LARGE_RAM_WORKERS,
            trace: Self::DEFAULT_TRACE,
            composite: Self::DEFAULT_COMPOSITE,
        }
    }
}

impl fmt::Display for PhasePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.prefilter, self.smooth, self.trace, self.composite
        )
    }
}

// ────────────────────────────── Scheduler ────────────────────────────

/// Drives a batch of jobs through every phase with a barrier between
/// phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduler {
    policy: PhasePolicy,
}

impl Scheduler {
    /// A scheduler using `policy` for pool sizes.
    #[must_use]
    pub const fn new(policy: PhasePolicy) -> Self {
        Self { policy }
    }

    /// The worker policy in use.
    #[must_use]
    pub const fn policy(&self) -> &PhasePolicy {
        &self.policy
    }

    /// Run all four phases over `jobs`.
    ///
    /// A phase returns only after every job has returned from it. Stage
    /// failures stay inside their job and never stop the batch.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::WorkerPool`] if a pool cannot be built,
    /// or [`PipelineError::PhaseOrder`] if a job was already advanced
    /// past the phase being run.
    pub fn run(&self, jobs: &mut [PipelineJob]) -> Result<(), PipelineError> {
        tracing::info!(jobs = jobs.len(), policy = %self.policy, "starting batch");
        for phase in Phase::ALL {
            self.run_phase(phase, jobs)?;
        }
        Ok(())
    }

    /// Run one phase over `jobs` in a pool of the phase's size and wait
    /// for every job to return.
    ///
    /// A phase with no enabled stages in any job builds no pool; the jobs
    /// only advance their state.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run). A phase-order error for one job does not
    /// stop the others; the first one is returned after the barrier.
    pub fn run_phase(&self, phase: Phase, jobs: &mut [PipelineJob]) -> Result<(), PipelineError> {
        if jobs.is_empty() {
            tracing::debug!(%phase, "no jobs, skipping");
            return Ok(());
        }
        if jobs
            .iter()
            .all(|j| j.definition().stages_in(phase).next().is_none())
        {
            tracing::info!(%phase, "no enabled stages, skipping");
            let mut first_err = None;
            for job in jobs.iter_mut() {
                if let Err(err) = job.run_phase(phase) {
                    first_err.get_or_insert(err);
                }
            }
            return first_err.map_or(Ok(()), Err);
        }

        let workers = self.policy.workers(phase).max(1);
        tracing::info!("running {phase} with {workers} workers");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |i| format!("phase{}-worker{i}", phase.number()))
            .build()
            .map_err(|source| PipelineError::WorkerPool { phase, source })?;

        let start = Instant::now();
        let (tx, rx) = mpsc::channel();
        pool.scope_fifo(|s| {
            for job in jobs.iter_mut() {
                let tx = tx.clone();
                s.spawn_fifo(move |_| {
                    if let Err(err) = job.run_phase(phase) {
                        tracing::error!(page = %job.name(), error = %err, "phase rejected");
                        // The receiver outlives the scope.
                        let _ = tx.send(err);
                    }
                });
            }
        });
        drop(tx);

        let failed = jobs.iter().filter(|j| j.failed()).count();
        tracing::info!(
            elapsed_secs = start.elapsed().as_secs(),
            failed_jobs = failed,
            "time taken for {phase}"
        );

        rx.into_iter().next().map_or(Ok(()), Err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::batch::BatchEntry;
    use crate::job::JobSettings;
    use crate::stage::{PipelineDefinition, Stage, StageContext, StageEngine, StageError};

    const GIB: u64 = 1024 * 1024 * 1024;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Start(Phase),
        End(Phase),
    }

    #[derive(Default)]
    struct GateState {
        in_flight: usize,
        max_in_flight: [usize; 4],
    }

    /// Records stage start/end events and holds each call until the
    /// phase's target concurrency has been observed once.
    struct GateEngine {
        target: [usize; 4],
        state: Mutex<GateState>,
        cv: Condvar,
        log: Mutex<Vec<Event>>,
    }

    impl GateEngine {
        fn new(policy: PhasePolicy, jobs: usize) -> Self {
            Self {
                target: Phase::ALL.map(|p| policy.workers(p).min(jobs)),
                state: Mutex::new(GateState::default()),
                cv: Condvar::new(),
                log: Mutex::new(Vec::new()),
            }
        }

        fn max_in_flight(&self, phase: Phase) -> usize {
            self.state.lock().unwrap().max_in_flight[phase.number() - 1]
        }
    }

    impl StageEngine for GateEngine {
        fn run(&self, stage: Stage, ctx: &StageContext) -> Result<(), StageError> {
            let phase = stage.phase();
            let idx = phase.number() - 1;
            self.log.lock().unwrap().push(Event::Start(phase));
            {
                let mut state = self.state.lock().unwrap();
                state.in_flight += 1;
                state.max_in_flight[idx] = state.max_in_flight[idx].max(state.in_flight);
                self.cv.notify_all();
                let (mut state, _) = self
                    .cv
                    .wait_timeout_while(state, Duration::from_secs(5), |s| {
                        s.max_in_flight[idx] < self.target[idx]
                    })
                    .unwrap();
                state.in_flight -= 1;
            }
            std::fs::write(ctx.output(stage), stage.name())?;
            self.log.lock().unwrap().push(Event::End(phase));
            Ok(())
        }
    }

    struct Batch {
        _tmp: tempfile::TempDir,
        jobs: Vec<PipelineJob>,
    }

    fn batch(count: usize, engine: Arc<dyn StageEngine>) -> Batch {
        batch_with(count, engine, PipelineDefinition::default())
    }

    fn batch_with(
        count: usize,
        engine: Arc<dyn StageEngine>,
        definition: PipelineDefinition,
    ) -> Batch {
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let out = tmp.path().join("out");
        std::fs::create_dir(&work).unwrap();
        std::fs::create_dir(&out).unwrap();
        let settings = JobSettings {
            work_dir: work,
            scale: 4,
            stage_timeout: None,
            definition: Arc::new(definition),
            engine,
        };
        let jobs = (0..count)
            .map(|i| {
                let srce = tmp.path().join(format!("{i:02}.jpg"));
                let upscayl = tmp.path().join(format!("{i:02}-x4.png"));
                std::fs::write(&srce, b"jpg").unwrap();
                std::fs::write(&upscayl, b"png").unwrap();
                let entry = BatchEntry {
                    srce,
                    upscayl,
                    dest: out.join(format!("{i:02}.png")),
                };
                PipelineJob::new(&entry, &settings).unwrap()
            })
            .collect();
        Batch { _tmp: tmp, jobs }
    }

    /// Every phase-k end precedes every phase-(k+1) start.
    fn assert_barrier(log: &[Event]) {
        for phase in Phase::ALL {
            let Some(next) = phase.next() else { continue };
            let last_end = log.iter().rposition(|e| *e == Event::End(phase));
            let first_start = log.iter().position(|e| *e == Event::Start(next));
            if let (Some(end), Some(start)) = (last_end, first_start) {
                assert!(end < start, "{next} started before {phase} drained");
            }
        }
    }

    fn run_with(policy: PhasePolicy, count: usize) -> Arc<GateEngine> {
        let engine = Arc::new(GateEngine::new(policy, count));
        let mut b = batch(count, Arc::clone(&engine) as Arc<dyn StageEngine>);
        Scheduler::new(policy).run(&mut b.jobs).unwrap();
        assert!(b.jobs.iter().all(|j| !j.failed()));
        assert!(b.jobs.iter().all(|j| j.state().is_complete()));
        engine
    }

    #[test]
    fn serial_pool_never_overlaps() {
        let engine = run_with(PhasePolicy::uniform(1), 4);
        for phase in Phase::ALL {
            assert_eq!(engine.max_in_flight(phase), 1);
        }
        assert_barrier(&engine.log.lock().unwrap());
    }

    #[test]
    fn concurrency_is_bounded_by_phase_workers() {
        let policy = PhasePolicy {
            prefilter: 3,
            smooth: 1,
            trace: 3,
            composite: 1,
        };
        let engine = run_with(policy, 10);
        assert_eq!(engine.max_in_flight(Phase::Prefilter), 3);
        assert_eq!(engine.max_in_flight(Phase::Smooth), 1);
        assert_eq!(engine.max_in_flight(Phase::Trace), 3);
        assert_eq!(engine.max_in_flight(Phase::Composite), 1);
        assert_barrier(&engine.log.lock().unwrap());
    }

    #[test]
    fn wide_pool_runs_whole_batch_at_once() {
        let engine = run_with(PhasePolicy::uniform(10), 10);
        for phase in Phase::ALL {
            assert_eq!(engine.max_in_flight(phase), 10);
        }
        assert_barrier(&engine.log.lock().unwrap());
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        Scheduler::new(PhasePolicy::default())
            .run(&mut [])
            .unwrap();
    }

    #[test]
    fn phase_without_enabled_stages_only_advances_state() {
        let policy = PhasePolicy::uniform(2);
        let engine = Arc::new(GateEngine::new(policy, 3));
        let definition = PipelineDefinition::default().without(Stage::Smooth);
        let mut b = batch_with(3, Arc::clone(&engine) as Arc<dyn StageEngine>, definition);

        Scheduler::new(policy).run(&mut b.jobs).unwrap();

        let log = engine.log.lock().unwrap();
        assert!(!log.contains(&Event::Start(Phase::Smooth)));
        assert!(log.contains(&Event::Start(Phase::Trace)));
        assert!(b.jobs.iter().all(|j| j.state().is_complete()));
        assert!(b.jobs.iter().all(|j| j.records().len() == 6));
    }

    #[test]
    fn rerunning_a_phase_is_rejected_after_the_barrier() {
        let engine = Arc::new(GateEngine::new(PhasePolicy::uniform(2), 2));
        let mut b = batch(2, engine);
        let scheduler = Scheduler::new(PhasePolicy::uniform(2));
        scheduler.run_phase(Phase::Prefilter, &mut b.jobs).unwrap();
        let err = scheduler
            .run_phase(Phase::Prefilter, &mut b.jobs)
            .unwrap_err();
        assert!(matches!(err, PipelineError::PhaseOrder { .. }));
    }

    #[test]
    fn smoothing_workers_follow_memory_tiers() {
        let tiers = MemoryTiers::default();
        let small = PhasePolicy::for_total_memory(8 * GIB, &tiers);
        let large = PhasePolicy::for_total_memory(32 * GIB, &tiers);
        assert_eq!(small.workers(Phase::Smooth), 1);
        assert_eq!(large.workers(Phase::Smooth), 3);
        for policy in [small, large] {
            assert_eq!(policy.workers(Phase::Prefilter), 10);
            assert_eq!(policy.workers(Phase::Trace), 10);
            assert_eq!(policy.workers(Phase::Composite), 1);
        }
    }

    #[test]
    fn with_workers_overrides_one_phase() {
        let policy = PhasePolicy::default().with_workers(Phase::Composite, 2);
        assert_eq!(policy.composite, 2);
        assert_eq!(policy.prefilter, PhasePolicy::DEFAULT_PREFILTER);
        assert_eq!(policy.to_string(), "10/3/10/2");
    }

    #[test]
    fn zero_workers_fail_validation() {
        let policy = PhasePolicy::default().with_workers(Phase::Trace, 0);
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("phase 3"));
    }

    #[test]
    fn partial_policy_json_fills_defaults() {
        let policy: PhasePolicy = serde_json::from_str(r#"{"smooth": 2}"#).unwrap();
        assert_eq!(policy.smooth, 2);
        assert_eq!(policy.prefilter, 10);
    }
}
