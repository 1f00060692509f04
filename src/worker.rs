use crate::partition::WorkerSlice;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// File name prefix of every rendered part. The `#` run is replaced by the
/// renderer with the zero-padded frame number.
pub const FRAME_FILE_PREFIX: &str = "pulverize_frames_";
pub const FRAME_NUMBER_PATTERN: &str = "#######";

const READER_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    /// `code` is `None` when the process was terminated by a signal.
    Exited { code: Option<i32> },
}

/// A running render worker as seen by the poll loop. None of these calls may
/// block on the worker.
pub trait WorkerProcess {
    fn poll_liveness(&mut self) -> Result<Liveness>;
    /// Text written to stdout since the previous call, or an empty string.
    fn drain_stdout(&mut self) -> String;
    /// Text written to stderr since the previous call, or an empty string.
    fn drain_stderr(&mut self) -> String;
    /// Terminate the worker if it is still running and reap it.
    fn kill(&mut self);
}

/// Starts one worker per slice.
pub trait WorkerLauncher {
    type Worker: WorkerProcess;

    fn launch(&mut self, slice: &WorkerSlice) -> Result<Self::Worker>;
}

/// Owns one spawned renderer. Output is read line by line on two background
/// threads and funneled into channels, so draining never waits on the child.
pub struct WorkerHandle {
    child: Child,
    stdout_rx: Receiver<String>,
    stderr_rx: Receiver<String>,
    readers: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(mut cmd: Command) -> Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {:?}", cmd.get_program()))?;

        let mut readers = Vec::with_capacity(2);
        let (stdout_tx, stdout_rx) = unbounded();
        let (stderr_tx, stderr_rx) = unbounded();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_forwarder(stdout, stdout_tx));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_forwarder(stderr, stderr_tx));
        }

        Ok(Self {
            child,
            stdout_rx,
            stderr_rx,
            readers,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Give the reader threads a bounded moment to forward the last lines once
    /// the child is gone. A grandchild holding the pipes open must not stall
    /// the poll loop.
    fn settle_readers(&mut self) {
        let deadline = Instant::now() + READER_GRACE;
        while self.readers.iter().any(|r| !r.is_finished()) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        self.readers.retain(|r| !r.is_finished());
    }
}

impl WorkerProcess for WorkerHandle {
    fn poll_liveness(&mut self) -> Result<Liveness> {
        match self.child.try_wait().context("failed to query worker status")? {
            None => Ok(Liveness::Running),
            Some(status) => {
                self.settle_readers();
                Ok(Liveness::Exited {
                    code: status.code(),
                })
            }
        }
    }

    fn drain_stdout(&mut self) -> String {
        drain_channel(&self.stdout_rx)
    }

    fn drain_stderr(&mut self) -> String {
        drain_channel(&self.stderr_rx)
    }

    fn kill(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(err) = self.child.kill() {
            tracing::warn!(pid = self.id(), error = %err, "failed to kill render worker");
            return;
        }
        if let Err(err) = self.child.wait() {
            tracing::warn!(pid = self.id(), error = %err, "failed to reap render worker");
        }
    }
}

fn spawn_line_forwarder(stream: impl Read + Send + 'static, tx: Sender<String>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf).unwrap_or(0);
            if read == 0 {
                break;
            }
            if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                break;
            }
        }
    })
}

fn drain_channel(rx: &Receiver<String>) -> String {
    let mut out = String::new();
    loop {
        match rx.try_recv() {
            Ok(chunk) => out.push_str(&chunk),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
    out
}

/// Builds the renderer invocation for one frame range.
#[derive(Debug, Clone)]
pub struct RenderCommand {
    pub renderer: PathBuf,
    pub project: PathBuf,
    pub output_dir: PathBuf,
}

impl RenderCommand {
    pub fn output_pattern(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}{}", FRAME_FILE_PREFIX, FRAME_NUMBER_PATTERN))
    }

    pub fn args(&self, slice: &WorkerSlice) -> Vec<OsString> {
        vec![
            "-b".into(),
            self.project.clone().into_os_string(),
            "-s".into(),
            slice.range.start().to_string().into(),
            "-e".into(),
            slice.range.end().to_string().into(),
            "-o".into(),
            self.output_pattern().into_os_string(),
            "-a".into(),
        ]
    }

    pub fn command(&self, slice: &WorkerSlice) -> Command {
        let mut cmd = Command::new(&self.renderer);
        cmd.args(self.args(slice));
        cmd
    }

    /// Shell-like rendering of the invocation for plans and dry runs.
    pub fn display(&self, slice: &WorkerSlice) -> String {
        display_command(&self.renderer, &self.args(slice))
    }
}

pub fn display_command(program: &Path, args: &[OsString]) -> String {
    let mut parts = vec![program.display().to_string()];
    parts.extend(args.iter().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Spawns real renderer processes.
pub struct RenderLauncher {
    command: RenderCommand,
}

impl RenderLauncher {
    pub fn new(command: RenderCommand) -> Self {
        Self { command }
    }
}

impl WorkerLauncher for RenderLauncher {
    type Worker = WorkerHandle;

    fn launch(&mut self, slice: &WorkerSlice) -> Result<WorkerHandle> {
        tracing::debug!(
            worker = slice.index,
            command = %self.command.display(slice),
            "spawning render worker"
        );
        let handle = WorkerHandle::spawn(self.command.command(slice))
            .with_context(|| format!("failed to start render worker {}", slice.index))?;
        tracing::info!(
            worker = slice.index,
            pid = handle.id(),
            start = slice.range.start(),
            end = slice.range.end(),
            "render worker started"
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::FrameRange;

    fn slice() -> WorkerSlice {
        WorkerSlice::new(2, FrameRange::new(34, 66).unwrap())
    }

    #[test]
    fn render_args_carry_range_and_pattern() {
        let cmd = RenderCommand {
            renderer: PathBuf::from("blender"),
            project: PathBuf::from("edit.blend"),
            output_dir: PathBuf::from("/out"),
        };
        assert_eq!(
            cmd.display(&slice()),
            "blender -b edit.blend -s 34 -e 66 -o /out/pulverize_frames_####### -a"
        );
    }

    #[cfg(unix)]
    #[test]
    fn handle_reports_output_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("echo 'Append frame 35'; echo oops >&2; echo 'Append frame 36'; exit 3");
        let mut handle = WorkerHandle::spawn(cmd).expect("spawn sh");

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut stdout = String::new();
        let mut stderr = String::new();
        let status = loop {
            let live = handle.poll_liveness().expect("poll");
            stdout.push_str(&handle.drain_stdout());
            stderr.push_str(&handle.drain_stderr());
            if let Liveness::Exited { .. } = live {
                break live;
            }
            assert!(Instant::now() < deadline, "worker never exited");
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(status, Liveness::Exited { code: Some(3) });

        // Late lines may still be in flight after the exit is observed.
        while Instant::now() < deadline && !(stdout.contains("36") && stderr.contains("oops")) {
            std::thread::sleep(Duration::from_millis(10));
            stdout.push_str(&handle.drain_stdout());
            stderr.push_str(&handle.drain_stderr());
        }
        assert_eq!(stdout, "Append frame 35\nAppend frame 36\n");
        assert_eq!(stderr, "oops\n");
        assert_eq!(handle.drain_stdout(), "");
    }

    #[cfg(unix)]
    #[test]
    fn kill_stops_a_running_worker() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exec sleep 30");
        let mut handle = WorkerHandle::spawn(cmd).expect("spawn sleep");
        assert_eq!(handle.poll_liveness().expect("poll"), Liveness::Running);

        let started = Instant::now();
        handle.kill();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            handle.poll_liveness().expect("poll"),
            Liveness::Exited { code: None }
        );
        // Killing an already reaped worker is a no-op.
        handle.kill();
    }
}
