use crate::error::PulverizeError;
use crate::partition::FrameRange;

use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Frame range and output location declared by a project file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectInfo {
    pub frames: FrameRange,
    pub output_dir: PathBuf,
}

/// Check the inputs exist, ask the renderer for the project settings and make
/// sure the output is a directory.
pub fn introspect(renderer: &Path, project: &Path, tool_script: &Path) -> Result<ProjectInfo> {
    if !project.is_file() {
        return Err(PulverizeError::invalid_input(format!(
            "project file {} does not exist",
            project.display()
        ))
        .into());
    }
    if !tool_script.is_file() {
        return Err(PulverizeError::invalid_input(format!(
            "helper script {} is missing",
            tool_script.display()
        ))
        .into());
    }

    tracing::debug!(
        renderer = %renderer.display(),
        project = %project.display(),
        "querying project settings"
    );
    let out = Command::new(renderer)
        .arg("-b")
        .arg(project)
        .arg("-P")
        .arg(tool_script)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .with_context(|| format!("failed to run renderer {}", renderer.display()))?;

    let text = String::from_utf8_lossy(&out.stdout);
    let info = parse_project_info(&text, project)?;

    if !info.output_dir.is_dir() {
        return Err(PulverizeError::invalid_input(format!(
            "project output {} is not a directory; set the render output to a directory and try again",
            info.output_dir.display()
        ))
        .into());
    }
    Ok(info)
}

/// Parse the `FRAMES:` and `OUTPUTDIR:` lines printed by the helper script.
pub fn parse_project_info(text: &str, project: &Path) -> Result<ProjectInfo, PulverizeError> {
    let frames_re = Regex::new(r"(?m)^FRAMES: (\d+) (\d+)\s*$").expect("valid frames regex");
    let outdir_re = Regex::new(r"(?m)^OUTPUTDIR: (.+?)\s*$").expect("valid outdir regex");

    let caps = frames_re.captures(text).ok_or_else(|| {
        PulverizeError::invalid_input("renderer did not report the project frame range")
    })?;
    let start = parse_frame(&caps[1])?;
    let end = parse_frame(&caps[2])?;
    let frames = FrameRange::new(start, end)?;

    let raw_dir = outdir_re
        .captures(text)
        .map(|c| c[1].to_string())
        .ok_or_else(|| {
            PulverizeError::invalid_input("renderer did not report the project output directory")
        })?;

    Ok(ProjectInfo {
        frames,
        output_dir: resolve_output_dir(&raw_dir, project),
    })
}

/// Expand the project-relative `//` prefix against the project's directory.
pub fn resolve_output_dir(raw: &str, project: &Path) -> PathBuf {
    let Some(rest) = raw.strip_prefix("//") else {
        return PathBuf::from(raw);
    };
    let parent = project
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let base = std::fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());
    base.join(rest)
}

fn parse_frame(raw: &str) -> Result<u64, PulverizeError> {
    raw.parse::<u64>()
        .map_err(|_| PulverizeError::invalid_input(format!("bad frame number {:?}", raw)))
}
