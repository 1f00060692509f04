use crate::error::PulverizeError;
use crate::worker::Liveness;
use std::fmt;
use std::time::Duration;

/// Hard cap on the default worker count. Rendering is a background job and
/// should not take over the whole machine.
pub const MAX_DEFAULT_WORKERS: usize = 6;

/// Inclusive frame interval. `end >= start` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    start: u64,
    end: u64,
}

impl FrameRange {
    pub fn new(start: u64, end: u64) -> Result<Self, PulverizeError> {
        if end < start {
            return Err(PulverizeError::invalid_input(format!(
                "frame range end {} is before start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for FrameRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// One worker's sub-range plus its live progress state.
#[derive(Debug, Clone)]
pub struct WorkerSlice {
    pub index: usize,
    pub range: FrameRange,
    /// Last frame the worker reported. Starts at `range.start`.
    pub current_frame: u64,
    /// Set once the worker printed its first frame marker.
    pub reported: bool,
    /// Time from job start until the worker's exit was first observed.
    pub finish_offset: Option<Duration>,
    /// The first `Exited` status seen for this worker.
    pub exit: Option<Liveness>,
}

impl WorkerSlice {
    pub fn new(index: usize, range: FrameRange) -> Self {
        Self {
            index,
            range,
            current_frame: range.start(),
            reported: false,
            finish_offset: None,
            exit: None,
        }
    }

    pub fn has_exited(&self) -> bool {
        self.finish_offset.is_some()
    }

    /// Frames finished so far. The worker prints `Append frame N` after
    /// writing frame N, so a reported frame counts itself.
    pub fn completed(&self) -> u64 {
        if self.reported {
            self.current_frame.saturating_sub(self.range.start()) + 1
        } else {
            0
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobPlan {
    pub total: FrameRange,
    pub slices: Vec<WorkerSlice>,
}

impl JobPlan {
    pub fn new(total: FrameRange, workers: usize) -> Result<Self, PulverizeError> {
        let slices = partition(total, workers)?
            .into_iter()
            .enumerate()
            .map(|(index, range)| WorkerSlice::new(index, range))
            .collect();
        Ok(Self { total, slices })
    }

    pub fn worker_count(&self) -> usize {
        self.slices.len()
    }

    /// Frames every worker renders, and the extra frames the last one takes.
    pub fn frames_per_worker(&self) -> (u64, u64) {
        let n = self.slices.len().max(1) as u64;
        (self.total.len() / n, self.total.len() % n)
    }
}

/// Split `total` into `workers` contiguous ranges. All remainder frames go to
/// the last range.
pub fn partition(total: FrameRange, workers: usize) -> Result<Vec<FrameRange>, PulverizeError> {
    if workers == 0 {
        return Err(PulverizeError::invalid_partition(
            "worker count must be at least 1",
        ));
    }
    let length = total.len();
    let n = workers as u64;
    if length < n {
        return Err(PulverizeError::invalid_partition(format!(
            "cannot split {} frame(s) {} across {} workers",
            length, total, workers
        )));
    }

    let base = length / n;
    let remainder = length % n;

    let mut ranges = Vec::with_capacity(workers);
    for i in 0..n {
        let start = total.start() + i * base;
        let mut end = start + base - 1;
        if i == n - 1 {
            end += remainder;
        }
        ranges.push(FrameRange { start, end });
    }
    Ok(ranges)
}

/// Half the logical processors, capped, never below one.
pub fn default_worker_count(processors: usize) -> usize {
    (processors / 2).min(MAX_DEFAULT_WORKERS).max(1)
}

/// Pick the worker count for a job of `frames` frames.
///
/// An explicit request must satisfy `1 <= requested <= processors` and fit the
/// range. The default heuristic is clamped to the range length instead.
pub fn resolve_worker_count(
    requested: Option<usize>,
    processors: usize,
    frames: u64,
) -> Result<usize, PulverizeError> {
    match requested {
        Some(n) => {
            if n == 0 || n > processors {
                return Err(PulverizeError::invalid_partition(format!(
                    "requested {} workers but {} logical processor(s) are available",
                    n, processors
                )));
            }
            if n as u64 > frames {
                return Err(PulverizeError::invalid_partition(format!(
                    "requested {} workers for only {} frame(s)",
                    n, frames
                )));
            }
            Ok(n)
        }
        None => {
            let n = default_worker_count(processors) as u64;
            Ok(n.min(frames).max(1) as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, end: u64) -> FrameRange {
        FrameRange::new(start, end).expect("valid range")
    }

    #[test]
    fn remainder_goes_to_last_slice() {
        let parts = partition(range(1, 100), 3).expect("partition");
        assert_eq!(parts, vec![range(1, 33), range(34, 66), range(67, 100)]);
        let lens = parts.iter().map(FrameRange::len).collect::<Vec<_>>();
        assert_eq!(lens, vec![33, 33, 34]);
    }

    #[test]
    fn single_worker_takes_whole_range() {
        let parts = partition(range(5, 9), 1).expect("partition");
        assert_eq!(parts, vec![range(5, 9)]);
    }

    #[test]
    fn partitions_cover_range_without_gaps() {
        for start in [0u64, 1, 17] {
            for len in 1u64..40 {
                let total = range(start, start + len - 1);
                for n in 1..=(len as usize).min(12) {
                    let parts = partition(total, n).expect("partition");
                    assert_eq!(parts.len(), n);
                    assert_eq!(parts[0].start(), total.start());
                    assert_eq!(parts[n - 1].end(), total.end());
                    for pair in parts.windows(2) {
                        assert_eq!(pair[0].end() + 1, pair[1].start());
                    }
                    let min = parts.iter().map(FrameRange::len).min().unwrap();
                    let max = parts.iter().map(FrameRange::len).max().unwrap();
                    assert!(max - min < n as u64, "{total} / {n}: {parts:?}");
                }
            }
        }
    }

    #[test]
    fn rejects_more_workers_than_frames() {
        let err = partition(range(1, 3), 4).unwrap_err();
        assert!(matches!(err, PulverizeError::InvalidPartition(_)));
        let err = partition(range(1, 3), 0).unwrap_err();
        assert!(matches!(err, PulverizeError::InvalidPartition(_)));
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(matches!(
            FrameRange::new(10, 9),
            Err(PulverizeError::InvalidInput(_))
        ));
        assert_eq!(range(7, 7).len(), 1);
    }

    #[test]
    fn default_worker_count_is_half_capped() {
        assert_eq!(default_worker_count(1), 1);
        assert_eq!(default_worker_count(4), 2);
        assert_eq!(default_worker_count(9), 4);
        assert_eq!(default_worker_count(64), MAX_DEFAULT_WORKERS);
    }

    #[test]
    fn explicit_worker_count_must_fit_processors() {
        assert_eq!(resolve_worker_count(Some(8), 8, 100).unwrap(), 8);
        assert!(matches!(
            resolve_worker_count(Some(9), 8, 100),
            Err(PulverizeError::InvalidPartition(_))
        ));
        assert!(matches!(
            resolve_worker_count(Some(0), 8, 100),
            Err(PulverizeError::InvalidPartition(_))
        ));
        assert!(matches!(
            resolve_worker_count(Some(4), 8, 3),
            Err(PulverizeError::InvalidPartition(_))
        ));
    }

    #[test]
    fn default_worker_count_clamps_to_frames() {
        assert_eq!(resolve_worker_count(None, 16, 100).unwrap(), 6);
        assert_eq!(resolve_worker_count(None, 16, 2).unwrap(), 2);
    }

    #[test]
    fn plan_reports_frames_per_worker() {
        let plan = JobPlan::new(range(1, 100), 3).expect("plan");
        assert_eq!(plan.worker_count(), 3);
        assert_eq!(plan.frames_per_worker(), (33, 1));
        assert!(plan
            .slices
            .iter()
            .all(|s| s.current_frame == s.range.start() && !s.has_exited()));
    }
}
