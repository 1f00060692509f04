use crate::tracker::ProgressSnapshot;
use crate::util::format_duration;

use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

/// What `renderer_for` builds once `Auto` has been settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayKind {
    Bar,
    Lines,
    Silent,
}

/// Display settings for the render step.
#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    /// Warn when the frame count has not moved for this long.
    pub idle_threshold: Duration,
    /// Minimum gap between two `[PROGRESS]` lines.
    pub plain_interval: Duration,
    stderr_is_tty: Option<bool>,
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            idle_threshold: Duration::from_secs(30),
            plain_interval: Duration::from_secs(2),
            stderr_is_tty: None,
        }
    }

    #[cfg(test)]
    pub fn assume_tty(mut self, is_tty: bool) -> Self {
        self.stderr_is_tty = Some(is_tty);
        self
    }

    /// `Auto` draws a bar on an interactive stderr and log lines otherwise.
    pub fn display_kind(self) -> DisplayKind {
        match self.mode {
            ProgressMode::Rich => DisplayKind::Bar,
            ProgressMode::Plain => DisplayKind::Lines,
            ProgressMode::Quiet => DisplayKind::Silent,
            ProgressMode::Auto => {
                let tty = self
                    .stderr_is_tty
                    .unwrap_or_else(|| std::io::stderr().is_terminal());
                if tty {
                    DisplayKind::Bar
                } else {
                    DisplayKind::Lines
                }
            }
        }
    }
}

/// Presentation layer for the poll loop. Nothing in the scheduling code
/// depends on a terminal being present.
pub trait SnapshotRenderer {
    fn render(&mut self, snapshot: &ProgressSnapshot);
    fn worker_stderr(&mut self, worker: usize, text: &str);
    fn finish(&mut self, snapshot: &ProgressSnapshot);
}

pub fn renderer_for(config: ProgressConfig, total_frames: u64) -> Box<dyn SnapshotRenderer> {
    match config.display_kind() {
        DisplayKind::Bar => Box::new(RichRenderer::new(total_frames)),
        DisplayKind::Lines => Box::new(PlainRenderer::new(config)),
        DisplayKind::Silent => Box::new(QuietRenderer),
    }
}

/// In-place bar redrawn on every tick.
pub struct RichRenderer {
    bar: ProgressBar,
}

impl RichRenderer {
    pub fn new(total_frames: u64) -> Self {
        let bar = ProgressBar::new(total_frames.max(1));
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} {wide_bar:.cyan/blue} {pos}/{len} frames {percent}% | {msg}",
            )
            .expect("valid progress template")
            .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message("starting");
        Self { bar }
    }
}

impl SnapshotRenderer for RichRenderer {
    fn render(&mut self, snapshot: &ProgressSnapshot) {
        self.bar.set_length(snapshot.total_frames.max(1));
        self.bar
            .set_position(snapshot.completed_frames.min(snapshot.total_frames));
        self.bar.set_message(format!(
            "elapsed {} remaining {}",
            format_duration(snapshot.elapsed),
            format_remaining(snapshot.remaining)
        ));
    }

    fn worker_stderr(&mut self, worker: usize, text: &str) {
        self.bar.suspend(|| {
            eprintln!("--------------- stderr worker {}", worker);
            eprint!("{}", text);
        });
    }

    fn finish(&mut self, snapshot: &ProgressSnapshot) {
        self.render(snapshot);
        self.bar.finish_with_message(format!(
            "elapsed {}",
            format_duration(snapshot.elapsed)
        ));
    }
}

/// Periodic log lines for non-interactive output, with an idle warning when
/// the frame count stops moving.
pub struct PlainRenderer {
    plain_interval: Duration,
    idle_threshold: Duration,
    last_emit: Option<Instant>,
    last_completed: u64,
    last_progress: Instant,
    last_idle_warn: Option<Instant>,
}

impl PlainRenderer {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            plain_interval: config.plain_interval,
            idle_threshold: config.idle_threshold,
            last_emit: None,
            last_completed: 0,
            last_progress: Instant::now(),
            last_idle_warn: None,
        }
    }

    fn emit(&self, snapshot: &ProgressSnapshot) {
        eprintln!("[PROGRESS] {}", plain_line(snapshot));
    }

    /// An unfinished job whose frame count has been flat for the idle
    /// threshold, with no warning printed within the last threshold either.
    fn stalled(&self, snapshot: &ProgressSnapshot, now: Instant) -> bool {
        if snapshot.completed_frames >= snapshot.total_frames {
            return false;
        }
        let flat_for = now.saturating_duration_since(self.last_progress);
        let since_warning = self
            .last_idle_warn
            .map(|t| now.saturating_duration_since(t));
        flat_for >= self.idle_threshold
            && since_warning.map_or(true, |d| d >= self.idle_threshold)
    }
}

impl SnapshotRenderer for PlainRenderer {
    fn render(&mut self, snapshot: &ProgressSnapshot) {
        let now = Instant::now();
        if snapshot.completed_frames != self.last_completed {
            self.last_completed = snapshot.completed_frames;
            self.last_progress = now;
        }

        let due = self
            .last_emit
            .map_or(true, |t| now.duration_since(t) >= self.plain_interval);
        if due {
            self.last_emit = Some(now);
            self.emit(snapshot);
        }

        if self.stalled(snapshot, now) {
            self.last_idle_warn = Some(now);
            eprintln!(
                "[WARN] IDLE WARNING: no frame progress for {}s ({} / {} frames)",
                now.duration_since(self.last_progress).as_secs(),
                snapshot.completed_frames,
                snapshot.total_frames
            );
        }
    }

    fn worker_stderr(&mut self, worker: usize, text: &str) {
        for line in text.lines() {
            eprintln!("[STDERR {}] {}", worker, line);
        }
    }

    fn finish(&mut self, snapshot: &ProgressSnapshot) {
        self.emit(snapshot);
    }
}

pub struct QuietRenderer;

impl SnapshotRenderer for QuietRenderer {
    fn render(&mut self, _snapshot: &ProgressSnapshot) {}
    fn worker_stderr(&mut self, _worker: usize, _text: &str) {}
    fn finish(&mut self, _snapshot: &ProgressSnapshot) {}
}

pub fn plain_line(snapshot: &ProgressSnapshot) -> String {
    format!(
        "{} / {} frames ({:.2}%) elapsed={} remaining={}",
        snapshot.completed_frames,
        snapshot.total_frames,
        snapshot.percent(),
        format_duration(snapshot.elapsed),
        format_remaining(snapshot.remaining)
    )
}

pub fn format_remaining(remaining: Option<Duration>) -> String {
    remaining
        .map(format_duration)
        .unwrap_or_else(|| "unknown".to_string())
}

fn idle_warning_due(
    now: Instant,
    last_progress: Instant,
    last_idle_warn: Option<Instant>,
    idle_threshold: Duration,
    completed: u64,
    total: u64,
) -> bool {
    if completed >= total && total > 0 {
        return false;
    }
    if now.duration_since(last_progress) < idle_threshold {
        return false;
    }
    match last_idle_warn {
        Some(last_warn) => now.duration_since(last_warn) >= idle_threshold,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::estimate;

    #[test]
    fn auto_follows_the_terminal() {
        let auto = ProgressConfig::new(ProgressMode::Auto);
        assert_eq!(auto.assume_tty(true).display_kind(), DisplayKind::Bar);
        assert_eq!(auto.assume_tty(false).display_kind(), DisplayKind::Lines);
        assert_eq!(
            ProgressConfig::new(ProgressMode::Quiet)
                .assume_tty(true)
                .display_kind(),
            DisplayKind::Silent
        );
        assert_eq!(
            ProgressConfig::new(ProgressMode::Plain)
                .assume_tty(true)
                .display_kind(),
            DisplayKind::Lines
        );
    }

    #[test]
    fn plain_line_shows_unknown_before_first_frame() {
        let line = plain_line(&estimate(0, 250, Duration::from_secs(4)));
        assert_eq!(
            line,
            "0 / 250 frames (0.00%) elapsed=00:04 remaining=unknown"
        );

        let line = plain_line(&estimate(50, 200, Duration::from_secs(60)));
        assert_eq!(
            line,
            "50 / 200 frames (25.00%) elapsed=01:00 remaining=03:00"
        );
    }

    #[test]
    fn stall_is_flagged_once_per_threshold() {
        let mut plain = PlainRenderer::new(ProgressConfig::new(ProgressMode::Plain));
        let t0 = plain.last_progress;
        let threshold = plain.idle_threshold;
        let stuck = estimate(10, 100, threshold);

        assert!(!plain.stalled(&stuck, t0 + threshold / 2));
        assert!(plain.stalled(&stuck, t0 + threshold));

        plain.last_idle_warn = Some(t0 + threshold);
        assert!(!plain.stalled(&stuck, t0 + threshold + Duration::from_secs(5)));
        assert!(plain.stalled(&stuck, t0 + threshold * 2));

        let done = estimate(100, 100, threshold);
        assert!(!plain.stalled(&done, t0 + threshold * 3));
    }
}
