use crate::display::ProgressConfig;
use crate::error::PulverizeError;
use serde::Deserialize;
use std::time::Duration;

pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const SPAWN_STAGGER: Duration = Duration::from_millis(250);

/// Options passed on the command line as a JSON object, e.g.
/// `'{"keepTempFiles":true,"displayStdErr":true}'`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Leave the rendered parts and the ffmpeg input list on disk.
    pub keep_temp_files: bool,
    /// Echo worker stderr and let ffmpeg print warnings.
    pub display_std_err: bool,
}

impl JobOptions {
    pub fn from_json(raw: &str) -> Result<Self, PulverizeError> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| PulverizeError::invalid_input(format!("options are not JSON: {}", e)))?;
        if !value.is_object() {
            return Err(PulverizeError::invalid_input(
                "options must be a JSON object",
            ));
        }
        serde_json::from_value(value)
            .map_err(|e| PulverizeError::invalid_input(format!("bad options: {}", e)))
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

/// Settings shared by the poll loop and the display, built once at startup.
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub options: JobOptions,
    pub progress: ProgressConfig,
    pub poll_interval: Duration,
    pub spawn_stagger: Duration,
    pub line_width: usize,
}

impl RunContext {
    pub fn new(options: JobOptions, progress: ProgressConfig, line_width: usize) -> Self {
        Self {
            options,
            progress,
            poll_interval: POLL_INTERVAL,
            spawn_stagger: SPAWN_STAGGER,
            line_width,
        }
    }
}
