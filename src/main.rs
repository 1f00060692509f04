mod concat;
mod config;
mod display;
mod error;
mod logging;
mod orchestrator;
mod partition;
mod project;
mod tracker;
mod util;
mod worker;

use anyhow::Result;
use clap::Parser;
use concat::{ConcatSummary, Concatenator};
use config::{JobOptions, LoggingConfig, RunContext};
use display::{ProgressConfig, ProgressMode};
use error::PulverizeError;
use orchestrator::{Orchestrator, RenderOutcome};
use partition::JobPlan;
use project::ProjectInfo;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use worker::{display_command, RenderCommand, RenderLauncher};

#[derive(Parser)]
#[command(
    name = "pulverize",
    version,
    about = "Multi-process Blender VSE rendering: split the frame range across workers, then join the parts with ffmpeg",
    after_help = "Example: pulverize project.blend 6 '{\"keepTempFiles\":true,\"displayStdErr\":true}'"
)]
struct Cli {
    /// Blender project file to render.
    project: PathBuf,

    /// Worker count, or the JSON options object.
    workers_or_options: Option<String>,

    /// JSON options object. keepTempFiles keeps the rendered parts and the
    /// ffmpeg input list; displayStdErr shows worker stderr and ffmpeg warnings.
    options: Option<String>,

    /// Renderer executable.
    #[arg(long, default_value = "blender")]
    renderer: PathBuf,

    /// ffmpeg executable used to join the parts.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// Helper script that prints the project settings. Default: pulverize_tool.py next to the executable.
    #[arg(long)]
    tool_script: Option<PathBuf>,

    /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
    #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
    progress: ProgressMode,

    /// Render the parts but don't join them.
    #[arg(long, default_value_t = false, conflicts_with = "concat_only")]
    render_only: bool,

    /// Don't render, just join parts already in the output directory.
    #[arg(long, default_value_t = false)]
    concat_only: bool,

    /// Print the plan and the commands without running them.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(&LoggingConfig {
        level: cli.log_level.clone(),
        json: cli.log_json,
    });

    let (workers_override, options) =
        parse_positionals(cli.workers_or_options.as_deref(), cli.options.as_deref())?;
    let ctx = RunContext::new(
        options,
        ProgressConfig::new(cli.progress),
        util::terminal_width(),
    );

    let tool_script = cli
        .tool_script
        .clone()
        .unwrap_or_else(util::default_tool_script);
    let info = project::introspect(&cli.renderer, &cli.project, &tool_script)?;

    let processors = num_cpus::get().max(1);
    let workers =
        partition::resolve_worker_count(workers_override, processors, info.frames.len())?;
    let plan = JobPlan::new(info.frames, workers)?;
    print_plan(processors, &info, &plan);

    let render_cmd = RenderCommand {
        renderer: cli.renderer.clone(),
        project: cli.project.clone(),
        output_dir: info.output_dir.clone(),
    };
    let concatenator = Concatenator {
        ffmpeg: cli.ffmpeg.clone(),
        output_dir: info.output_dir.clone(),
        keep_temp_files: ctx.options.keep_temp_files,
        display_std_err: ctx.options.display_std_err,
    };

    if cli.dry_run {
        print_dry_run(&cli, &plan, &render_cmd, &concatenator);
        return Ok(());
    }

    if !cli.render_only {
        util::ensure_tool_available(&cli.ffmpeg)?;
    }

    let started = Instant::now();

    let render_outcome = if cli.concat_only {
        None
    } else {
        util::print_header("Step 1/2 Rendering with Blender", ctx.line_width);
        let mut renderer = display::renderer_for(ctx.progress, plan.total.len());
        let mut launcher = RenderLauncher::new(render_cmd);
        let outcome = Orchestrator::new(ctx, renderer.as_mut()).run(plan, &mut launcher)?;
        Some(outcome)
    };

    let concat_summary = if cli.render_only {
        None
    } else {
        util::print_header("Step 2/2 Concatenating videos with FFMPEG", ctx.line_width);
        Some(concatenator.run(info.frames)?)
    };

    util::print_header("All done!", ctx.line_width);
    print_summary(
        started.elapsed(),
        render_outcome.as_ref(),
        concat_summary.as_ref(),
    );
    Ok(())
}

/// The second positional is either a worker count or the options object; the
/// third is always the options object.
fn parse_positionals(
    second: Option<&str>,
    third: Option<&str>,
) -> Result<(Option<usize>, JobOptions), PulverizeError> {
    let mut workers = None;
    let mut options = None;

    if let Some(raw) = second {
        let raw = raw.trim();
        if let Ok(n) = raw.parse::<usize>() {
            workers = Some(n);
        } else if raw.starts_with('{') {
            options = Some(JobOptions::from_json(raw)?);
        } else {
            return Err(PulverizeError::invalid_input(format!(
                "expected a worker count or a JSON options object, got {:?}",
                raw
            )));
        }
    }

    if let Some(raw) = third {
        if options.is_some() {
            return Err(PulverizeError::invalid_input(
                "options object given twice",
            ));
        }
        options = Some(JobOptions::from_json(raw.trim())?);
    }

    Ok((workers, options.unwrap_or_default()))
}

fn print_plan(processors: usize, info: &ProjectInfo, plan: &JobPlan) {
    let (per_worker, remainder) = plan.frames_per_worker();
    println!(
        "It looks like your machine has {} logical processor(s). The default is half of them, with a max of {}.",
        processors,
        partition::MAX_DEFAULT_WORKERS
    );
    println!(
        "Project: start_frame={} end_frame={} output_dir={}",
        info.frames.start(),
        info.frames.end(),
        info.output_dir.display()
    );
    println!(
        "Render plan: frames={} workers={} frames_per_worker={} remainder={}",
        plan.total.len(),
        plan.worker_count(),
        per_worker,
        remainder
    );
    println!(
        "Each worker renders {} frames, except the last renders an extra {} frame(s).",
        per_worker, remainder
    );
    tracing::debug!(?plan, "job plan");
}

fn print_dry_run(cli: &Cli, plan: &JobPlan, render_cmd: &RenderCommand, concat: &Concatenator) {
    println!("Dry run: nothing will be rendered or joined.");
    if !cli.concat_only {
        for slice in &plan.slices {
            println!("  worker {}: {}", slice.index, render_cmd.display(slice));
        }
    }
    if !cli.render_only {
        let output = format!("{:07}-{:07}.<ext>", plan.total.start(), plan.total.end());
        println!(
            "  concat (in {}): {}",
            concat.output_dir.display(),
            display_command(&concat.ffmpeg, &concat.args(&output))
        );
    }
}

fn print_summary(
    total: Duration,
    render: Option<&RenderOutcome>,
    concat: Option<&ConcatSummary>,
) {
    println!("Total time: {}", util::format_duration(total));

    if let Some(outcome) = render {
        let worker_time = outcome.worker_time();
        let saved = worker_time.as_secs() as i64 - total.as_secs() as i64;
        println!(
            "Render summary: workers={} frames={} polls={} render_elapsed={} blender_time={}",
            outcome.slices.len(),
            outcome.final_snapshot.total_frames,
            outcome.ticks,
            util::format_duration(outcome.elapsed),
            util::format_duration(worker_time),
        );
        println!(
            "\nYou saved this much time by running this instead of rendering directly from Blender's VSE:\n{}",
            util::format_signed_secs(saved)
        );
        for failure in &outcome.failures {
            println!("  warning: {}", failure);
        }
    }

    if let Some(summary) = concat {
        println!(
            "Concat summary: output={} parts={} temp_removed={} duration={}",
            summary.output.display(),
            summary.input_count,
            summary.removed_temp_files,
            util::format_duration(summary.elapsed),
        );
    }
}
