use crate::error::PulverizeError;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

pub const TOOL_SCRIPT_NAME: &str = "pulverize_tool.py";
const DEFAULT_LINE_WIDTH: usize = 80;
const MIN_LINE_WIDTH: usize = 20;

pub fn ensure_tool_available(program: &Path) -> Result<()> {
    let out = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            PulverizeError::invalid_input(format!(
                "failed to run {} -version: {}",
                program.display(),
                e
            ))
        })?;
    if !out.status.success() {
        return Err(PulverizeError::invalid_input(format!(
            "{} exists but returned non-zero on -version",
            program.display()
        ))
        .into());
    }
    Ok(())
}

/// Helper script shipped next to the executable, else in the working directory.
pub fn default_tool_script() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(TOOL_SCRIPT_NAME)))
        .filter(|p| p.is_file())
        .unwrap_or_else(|| PathBuf::from(TOOL_SCRIPT_NAME))
}

/// Terminal width for banners: `COLUMNS` if set, else the size of the
/// terminal on stdout, else 80.
pub fn terminal_width() -> usize {
    let queried = console::Term::stdout()
        .size_checked()
        .map(|(_rows, cols)| usize::from(cols));
    pick_width(std::env::var("COLUMNS").ok().as_deref(), queried)
}

fn pick_width(columns_env: Option<&str>, queried: Option<usize>) -> usize {
    columns_env
        .and_then(|v| v.trim().parse::<usize>().ok())
        .or(queried)
        .filter(|w| *w >= MIN_LINE_WIDTH)
        .unwrap_or(DEFAULT_LINE_WIDTH)
}

pub fn print_header(text: &str, width: usize) {
    println!("\n{}", header(text, width));
}

fn header(text: &str, width: usize) -> String {
    let title = format!("# {}", text);
    let width = width.max(title.len() + 2);
    let rule = "#".repeat(width);
    let pad = " ".repeat(width - title.len() - 1);
    format!("{}\n{}{}#\n{}\n", rule, title, pad, rule)
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

/// Duration difference that may be negative, e.g. `-00:12`.
pub fn format_signed_secs(secs: i64) -> String {
    let body = format_duration(Duration::from_secs(secs.unsigned_abs()));
    if secs < 0 {
        format!("-{}", body)
    } else {
        body
    }
}

pub fn remove_files(paths: &[PathBuf]) -> Result<()> {
    for p in paths {
        std::fs::remove_file(p).with_context(|| format!("failed to remove {}", p.display()))?;
    }
    Ok(())
}
