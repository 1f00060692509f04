use crate::partition::{JobPlan, WorkerSlice};
use crate::worker::Liveness;

use regex::Regex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Extracts the most recent completed frame from a chunk of worker output.
pub type FrameParser = fn(&str) -> Option<u64>;

fn append_frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^Append frame (\d+)").expect("valid progress regex"))
}

/// Reads `Append frame <N>` markers. Only the last marker in the chunk counts.
pub fn parse_append_frame(chunk: &str) -> Option<u64> {
    append_frame_re()
        .captures_iter(chunk)
        .filter_map(|c| c[1].parse::<u64>().ok())
        .last()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub completed_frames: u64,
    pub total_frames: u64,
    pub elapsed: Duration,
    /// `None` until at least one frame has completed.
    pub remaining: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn fraction(&self) -> f64 {
        if self.total_frames == 0 {
            return 0.0;
        }
        self.completed_frames as f64 / self.total_frames as f64
    }

    pub fn percent(&self) -> f64 {
        self.fraction() * 100.0
    }
}

/// Owns the job plan and folds worker output into one frame count.
pub struct ProgressTracker {
    plan: JobPlan,
    started: Instant,
    parser: FrameParser,
}

impl ProgressTracker {
    pub fn new(plan: JobPlan, started: Instant) -> Self {
        Self::with_parser(plan, started, parse_append_frame)
    }

    pub fn with_parser(plan: JobPlan, started: Instant, parser: FrameParser) -> Self {
        Self {
            plan,
            started,
            parser,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn slices(&self) -> &[WorkerSlice] {
        &self.plan.slices
    }

    pub fn into_plan(self) -> JobPlan {
        self.plan
    }

    /// Feed a stdout chunk from worker `index`. Returns the frame applied.
    pub fn apply_output(&mut self, index: usize, chunk: &str) -> Option<u64> {
        if chunk.is_empty() {
            return None;
        }
        let frame = (self.parser)(chunk)?;
        if let Some(slice) = self.plan.slices.get_mut(index) {
            slice.current_frame = frame;
            slice.reported = true;
        }
        Some(frame)
    }

    /// Record the first observed exit of worker `index`. Later calls are no-ops.
    pub fn mark_exited(&mut self, index: usize, code: Option<i32>, now: Instant) {
        let started = self.started;
        if let Some(slice) = self.plan.slices.get_mut(index) {
            if slice.finish_offset.is_none() {
                slice.finish_offset = Some(now.saturating_duration_since(started));
                slice.exit = Some(Liveness::Exited { code });
            }
        }
    }

    pub fn all_exited(&self) -> bool {
        self.plan.slices.iter().all(WorkerSlice::has_exited)
    }

    /// Sum of per-slice progress, driven only by reported frames. The exit
    /// status never adds frames.
    pub fn completed_frames(&self) -> u64 {
        self.plan.slices.iter().map(WorkerSlice::completed).sum()
    }

    pub fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        estimate(
            self.completed_frames(),
            self.plan.total.len(),
            now.saturating_duration_since(self.started),
        )
    }

    /// Snapshot reporting the whole range as done.
    pub fn final_snapshot(&self, now: Instant) -> ProgressSnapshot {
        let total = self.plan.total.len();
        estimate(total, total, now.saturating_duration_since(self.started))
    }
}

/// Linear extrapolation from the fraction done so far.
pub fn estimate(completed: u64, total: u64, elapsed: Duration) -> ProgressSnapshot {
    let remaining = if completed == 0 || total == 0 {
        None
    } else {
        let progress = completed as f64 / total as f64;
        let estimated_total = elapsed.as_secs_f64() / progress;
        Some(Duration::from_secs_f64(
            (estimated_total - elapsed.as_secs_f64()).max(0.0),
        ))
    };
    ProgressSnapshot {
        completed_frames: completed,
        total_frames: total,
        elapsed,
        remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::FrameRange;

    fn tracker() -> ProgressTracker {
        let plan = JobPlan::new(FrameRange::new(1, 100).unwrap(), 3).unwrap();
        ProgressTracker::new(plan, Instant::now())
    }

    #[test]
    fn last_marker_in_chunk_wins() {
        let chunk = "Fra:10 Mem:1M\nAppend frame 10\nAppend frame 11\nTime: 00:01\nAppend frame 12\n";
        assert_eq!(parse_append_frame(chunk), Some(12));
        assert_eq!(parse_append_frame("Saved: x.png\n"), None);
        assert_eq!(parse_append_frame(""), None);
    }

    #[test]
    fn marker_must_start_a_line() {
        assert_eq!(parse_append_frame("note: Append frame 9\n"), None);
        assert_eq!(parse_append_frame("x\nAppend frame 9 done"), Some(9));
    }

    #[test]
    fn completed_frames_count_reported_frames_per_slice() {
        let mut t = tracker();
        assert_eq!(t.completed_frames(), 0);
        assert_eq!(t.apply_output(0, "Append frame 10\n"), Some(10));
        t.apply_output(2, "Append frame 70\nAppend frame 77\n");
        t.apply_output(1, "nothing useful\n");
        // Frames 1..=10 and 67..=77.
        assert_eq!(t.completed_frames(), 10 + 11);
    }

    #[test]
    fn injected_parser_is_used() {
        fn always_five(_: &str) -> Option<u64> {
            Some(5)
        }
        let plan = JobPlan::new(FrameRange::new(1, 10).unwrap(), 1).unwrap();
        let mut t = ProgressTracker::with_parser(plan, Instant::now(), always_five);
        t.apply_output(0, "anything");
        assert_eq!(t.completed_frames(), 5);
    }

    #[test]
    fn progress_is_monotonic_and_reaches_total_at_range_ends() {
        let mut t = tracker();
        let mut last = 0;
        for step in 0..=33u64 {
            t.apply_output(0, &format!("Append frame {}\n", 1 + step.min(32)));
            t.apply_output(1, &format!("Append frame {}\n", 34 + step.min(32)));
            t.apply_output(2, &format!("Append frame {}\n", 67 + step));
            let done = t.completed_frames();
            assert!(done >= last);
            last = done;
        }
        // Every worker is on its last frame and still running.
        assert_eq!(t.completed_frames(), 100);
        assert!(!t.all_exited());

        let now = Instant::now();
        for i in 0..3 {
            t.mark_exited(i, Some(0), now);
        }
        assert_eq!(t.completed_frames(), 100);
        assert!(t.all_exited());
    }

    #[test]
    fn clean_exit_without_output_adds_no_frames() {
        let mut t = tracker();
        let now = Instant::now();
        for i in 0..3 {
            t.mark_exited(i, Some(0), now);
        }
        assert!(t.all_exited());
        assert_eq!(t.completed_frames(), 0);
        assert_eq!(t.snapshot(now).remaining, None);
        assert_eq!(t.final_snapshot(now).completed_frames, 100);
    }

    #[test]
    fn failed_worker_keeps_its_last_frame() {
        let mut t = tracker();
        t.apply_output(1, "Append frame 40\n");
        t.mark_exited(1, Some(1), Instant::now());
        assert_eq!(t.completed_frames(), 7);
        assert!(!t.all_exited());
    }

    #[test]
    fn exit_is_recorded_once() {
        let mut t = tracker();
        let start = t.started();
        t.mark_exited(0, Some(0), start + Duration::from_secs(5));
        t.mark_exited(0, Some(9), start + Duration::from_secs(50));
        let slice = &t.slices()[0];
        assert_eq!(slice.finish_offset, Some(Duration::from_secs(5)));
        assert_eq!(slice.exit, Some(Liveness::Exited { code: Some(0) }));
    }

    #[test]
    fn zero_progress_has_unknown_remaining_time() {
        let snap = estimate(0, 100, Duration::from_secs(30));
        assert_eq!(snap.remaining, None);
        assert_eq!(snap.percent(), 0.0);
    }

    #[test]
    fn remaining_time_extrapolates_linearly() {
        let snap = estimate(25, 100, Duration::from_secs(30));
        assert_eq!(snap.remaining, Some(Duration::from_secs(90)));
        let done = estimate(100, 100, Duration::from_secs(30));
        assert_eq!(done.remaining, Some(Duration::ZERO));
    }
}
