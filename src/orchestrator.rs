use crate::config::RunContext;
use crate::display::SnapshotRenderer;
use crate::error::PulverizeError;
use crate::partition::{JobPlan, WorkerSlice};
use crate::tracker::{ProgressSnapshot, ProgressTracker};
use crate::worker::{Liveness, WorkerLauncher, WorkerProcess};

use anyhow::Result;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Spawning,
    Polling,
    AllDone,
}

#[derive(Debug)]
pub struct RenderOutcome {
    pub slices: Vec<WorkerSlice>,
    pub elapsed: Duration,
    pub final_snapshot: ProgressSnapshot,
    pub failures: Vec<PulverizeError>,
    pub ticks: u64,
}

impl RenderOutcome {
    /// Sum of every worker's time until exit.
    pub fn worker_time(&self) -> Duration {
        self.slices.iter().filter_map(|s| s.finish_offset).sum()
    }
}

/// Drives the workers of one job from spawn to the last exit.
pub struct Orchestrator<'a> {
    ctx: RunContext,
    renderer: &'a mut dyn SnapshotRenderer,
    phase: Phase,
}

impl<'a> Orchestrator<'a> {
    pub fn new(ctx: RunContext, renderer: &'a mut dyn SnapshotRenderer) -> Self {
        Self {
            ctx,
            renderer,
            phase: Phase::Spawning,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn run<L: WorkerLauncher>(&mut self, plan: JobPlan, launcher: &mut L) -> Result<RenderOutcome> {
        let started = Instant::now();
        let mut tracker = ProgressTracker::new(plan, started);

        self.phase = Phase::Spawning;
        let mut workers = Vec::with_capacity(tracker.slices().len());
        if let Err(err) = self.spawn_all(tracker.slices(), launcher, &mut workers) {
            abort_workers(&mut workers);
            return Err(err);
        }

        self.phase = Phase::Polling;
        let mut ticks = 0u64;
        loop {
            std::thread::sleep(self.ctx.poll_interval);
            ticks += 1;
            let running = match self.poll_once(&mut tracker, &mut workers) {
                Ok(running) => running,
                Err(err) => {
                    abort_workers(&mut workers);
                    return Err(err);
                }
            };
            let snapshot = tracker.snapshot(Instant::now());
            self.renderer.render(&snapshot);
            if !running {
                break;
            }
        }

        debug_assert!(tracker.all_exited());

        // Pick up output that arrived between the exit and the last drain.
        for (i, worker) in workers.iter_mut().enumerate() {
            self.drain_worker(&mut tracker, i, worker);
        }

        self.phase = Phase::AllDone;
        tracing::debug!(phase = ?self.phase, ticks, "all workers exited");
        let now = Instant::now();
        let final_snapshot = tracker.final_snapshot(now);
        let elapsed = now.duration_since(tracker.started());
        self.renderer.finish(&final_snapshot);

        let failures = collect_failures(tracker.slices());
        for failure in &failures {
            tracing::warn!("{}", failure);
        }

        Ok(RenderOutcome {
            slices: tracker.into_plan().slices,
            elapsed,
            final_snapshot,
            failures,
            ticks,
        })
    }

    fn spawn_all<L: WorkerLauncher>(
        &self,
        slices: &[WorkerSlice],
        launcher: &mut L,
        workers: &mut Vec<L::Worker>,
    ) -> Result<()> {
        for (i, slice) in slices.iter().enumerate() {
            if i > 0 && !self.ctx.spawn_stagger.is_zero() {
                std::thread::sleep(self.ctx.spawn_stagger);
            }
            workers.push(launcher.launch(slice)?);
        }
        Ok(())
    }

    /// One pass over every worker. Returns whether any is still running.
    fn poll_once<W: WorkerProcess>(
        &mut self,
        tracker: &mut ProgressTracker,
        workers: &mut [W],
    ) -> Result<bool> {
        let mut running = false;
        for (i, worker) in workers.iter_mut().enumerate() {
            if !tracker.slices()[i].has_exited() {
                match worker.poll_liveness()? {
                    Liveness::Running => running = true,
                    Liveness::Exited { code } => {
                        tracing::info!(worker = i, ?code, "render worker exited");
                        tracker.mark_exited(i, code, Instant::now());
                    }
                }
            }
            self.drain_worker(tracker, i, worker);
        }
        Ok(running)
    }

    fn drain_worker<W: WorkerProcess>(
        &mut self,
        tracker: &mut ProgressTracker,
        index: usize,
        worker: &mut W,
    ) {
        let stderr = worker.drain_stderr();
        if !stderr.is_empty() && self.ctx.options.display_std_err {
            self.renderer.worker_stderr(index, &stderr);
        }
        let stdout = worker.drain_stdout();
        tracker.apply_output(index, &stdout);
    }
}

/// Stop every launched worker after the run failed, so no renderer keeps
/// writing frames once we have given up on the job.
fn abort_workers<W: WorkerProcess>(workers: &mut [W]) {
    for (i, worker) in workers.iter_mut().enumerate() {
        tracing::warn!(worker = i, "stopping render worker");
        worker.kill();
    }
}

fn collect_failures(slices: &[WorkerSlice]) -> Vec<PulverizeError> {
    slices
        .iter()
        .filter_map(|s| {
            let code = match s.exit {
                Some(Liveness::Exited { code }) => code,
                Some(Liveness::Running) | None => return None,
            };
            let reason = match code {
                Some(0) if !s.reported => format!(
                    "exited cleanly without reporting a frame of {}",
                    s.range
                ),
                Some(0) => return None,
                Some(code) => format!(
                    "exited with code {} at frame {} of {}",
                    code, s.current_frame, s.range
                ),
                None => format!(
                    "terminated by signal at frame {} of {}",
                    s.current_frame, s.range
                ),
            };
            Some(PulverizeError::WorkerFailure {
                worker: s.index,
                reason,
            })
        })
        .collect()
}
