use crate::error::PulverizeError;
use crate::partition::FrameRange;
use crate::util;
use crate::worker::{display_command, FRAME_FILE_PREFIX};

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

pub const MANIFEST_NAME: &str = "pulverize_input_files.txt";
const FRAME_NUMBER_WIDTH: usize = 7;

#[derive(Debug, Clone)]
pub struct ConcatSummary {
    pub output: PathBuf,
    pub input_count: usize,
    pub removed_temp_files: bool,
    pub elapsed: Duration,
}

/// Joins the rendered parts in the output directory with a stream-copy ffmpeg
/// concat.
#[derive(Debug, Clone)]
pub struct Concatenator {
    pub ffmpeg: PathBuf,
    pub output_dir: PathBuf,
    pub keep_temp_files: bool,
    pub display_std_err: bool,
}

impl Concatenator {
    pub fn run(&self, total: FrameRange) -> Result<ConcatSummary> {
        let started = Instant::now();
        let files = list_frame_files(&self.output_dir)?;
        if files.is_empty() {
            return Err(PulverizeError::concatenation(format!(
                "no {}* files in {}; check whether the render worked",
                FRAME_FILE_PREFIX,
                self.output_dir.display()
            ))
            .into());
        }

        let manifest_path = self.output_dir.join(MANIFEST_NAME);
        std::fs::write(&manifest_path, build_manifest(&files))
            .with_context(|| format!("failed to write {}", manifest_path.display()))?;

        let output_name = output_file_name(total, &files[0])?;
        let args = self.args(&output_name);
        println!("$ {}", display_command(&self.ffmpeg, &args));
        tracing::debug!(inputs = files.len(), output = %output_name, "running concatenation");

        let status = Command::new(&self.ffmpeg)
            .args(&args)
            .current_dir(&self.output_dir)
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("failed to run {}", self.ffmpeg.display()))?;
        if !status.success() {
            return Err(PulverizeError::concatenation(format!(
                "{} exited with {}; temporary files kept in {}",
                self.ffmpeg.display(),
                status,
                self.output_dir.display()
            ))
            .into());
        }

        let removed_temp_files = !self.keep_temp_files;
        if removed_temp_files {
            println!("\nRemoving temporary video files...");
            let mut temp = Vec::with_capacity(files.len() + 1);
            temp.push(manifest_path);
            temp.extend(files.iter().map(|f| self.output_dir.join(f)));
            util::remove_files(&temp)?;
        }

        Ok(ConcatSummary {
            output: self.output_dir.join(&output_name),
            input_count: files.len(),
            removed_temp_files,
            elapsed: started.elapsed(),
        })
    }

    pub fn args(&self, output_name: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if !self.display_std_err {
            args.push("-v".into());
            args.push("error".into());
        }
        for a in ["-y", "-stats", "-f", "concat", "-safe", "0", "-i", MANIFEST_NAME, "-c", "copy"] {
            args.push(a.into());
        }
        args.push(output_name.into());
        args
    }
}

/// Names of the rendered parts, sorted by file name. Zero-padded frame
/// numbers make that frame order.
pub fn list_frame_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let e = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        if !e.file_type().is_file() {
            continue;
        }
        let name = e.file_name().to_string_lossy().into_owned();
        if name.starts_with(FRAME_FILE_PREFIX) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

pub fn build_manifest(files: &[String]) -> String {
    files
        .iter()
        .map(|f| format!("file {}", f))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `<start>-<end>.<ext>` with 7-digit frame numbers and the extension of the
/// first part (everything after its first dot).
pub fn output_file_name(total: FrameRange, first_file: &str) -> Result<String, PulverizeError> {
    let ext = first_file
        .split_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty())
        .ok_or_else(|| {
            PulverizeError::concatenation(format!(
                "cannot tell the container of {} (no extension)",
                first_file
            ))
        })?;
    Ok(format!(
        "{:0width$}-{:0width$}.{}",
        total.start(),
        total.end(),
        ext,
        width = FRAME_NUMBER_WIDTH
    ))
}
