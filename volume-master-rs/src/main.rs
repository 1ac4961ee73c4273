//! VolumeMaster - headless merge daemon.
//!
//! Lists outputs, cleans up leftover virtual endpoints, or runs the merge
//! coordinator with a line console on stdin.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use volume_master_rs::merge::{DisplaySink, MergeRequest, VolumeIndicator};
use volume_master_rs::{AppConfig, EngineHandle, EngineOptions, Platform};

/// Merge two audio outputs into one virtual output device
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, env = "VOLUME_MASTER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List output endpoints
    List,
    /// Destroy virtual endpoints left behind by a previous run
    Cleanup,
    /// Run the merge coordinator with a console on stdin
    Run(RunArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// UID of the primary (left, clock master) output
    #[arg(long, requires = "secondary")]
    primary: Option<String>,

    /// UID of the secondary (right) output
    #[arg(long, requires = "primary")]
    secondary: Option<String>,

    /// Stack the outputs as left and right channels
    #[arg(long)]
    stereo_split: bool,

    /// Balance follows the focused window (needs --stereo-split)
    #[arg(long)]
    spatial: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => AppConfig::default_path().context("no configuration path")?,
    };
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    init_logging(config.log_level.as_deref().unwrap_or("info"));
    info!(config = %config_path.display(), "VolumeMaster starting");

    match cli.command {
        Command::List => list_outputs(),
        Command::Cleanup => cleanup(),
        Command::Run(args) => run(args, config, config_path),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn list_outputs() -> Result<()> {
    let engine = Platform::native().into_engine(EngineOptions::default());
    let directory = engine.directory();
    let default_uid = directory.default_output_device().map(|d| d.uid);

    for device in directory.output_devices() {
        let marker = if Some(&device.uid) == default_uid.as_ref() { "*" } else { " " };
        println!("{marker} {:<40} {}", device.name, device.uid);
    }
    Ok(())
}

fn cleanup() -> Result<()> {
    let mut engine = Platform::native().into_engine(EngineOptions::default());
    let removed = engine.cleanup_orphans();
    println!("removed {removed} virtual endpoint(s)");
    Ok(())
}

fn run(args: RunArgs, mut config: AppConfig, config_path: PathBuf) -> Result<()> {
    let platform = Platform::native();
    info!(backend = platform.name, "using audio backend");

    let options = EngineOptions {
        unmerge_on_disconnect: config.merge.unmerge_on_disconnect,
        ..EngineOptions::default()
    };
    let handle = EngineHandle::spawn(platform.into_engine(options)).context("starting merge coordinator")?;

    let display: DisplaySink = Arc::new(|indicator: VolumeIndicator| match indicator.muted {
        Some(muted) => info!(volume = indicator.volume, muted, "volume"),
        None => info!(volume = indicator.volume, "volume"),
    });
    handle.set_display_sink(Some(display))?;

    let removed = handle.cleanup_orphans()?;
    if removed > 0 {
        info!(removed, "cleaned up leftover virtual endpoints");
    }

    if let (Some(primary), Some(secondary)) = (args.primary, args.secondary) {
        config.merge.primary_uid = primary;
        config.merge.secondary_uid = secondary;
        config.merge.stereo_split = args.stereo_split;
        config.merge.spatial_audio = args.spatial;
        config.merge.enabled = true;
    }

    if config.merge.enabled {
        if let Some(request) = config.merge_request() {
            if let Err(e) = merge(&handle, &request) {
                warn!(error = %e, "startup merge failed");
            }
        }
    }

    let result = console(&handle, &mut config, &config_path);
    handle.shutdown();
    info!("VolumeMaster stopped");
    result
}

fn merge(handle: &EngineHandle, request: &MergeRequest) -> Result<()> {
    let id = handle
        .create_merge(request.clone())
        .with_context(|| format!("merging {} + {}", request.primary_uid, request.secondary_uid))?;
    println!("merged into endpoint {id}");
    Ok(())
}

fn console(handle: &EngineHandle, config: &mut AppConfig, config_path: &Path) -> Result<()> {
    let mut editor = DefaultEditor::new().context("opening console")?;

    loop {
        let line = match editor.readline("volume-master> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e).context("reading console"),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match execute(handle, config, config_path, line) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("error: {e:#}"),
        }
    }
    Ok(())
}

/// Run one console command. Returns false on `quit`.
fn execute(handle: &EngineHandle, config: &mut AppConfig, config_path: &Path, line: &str) -> Result<bool> {
    let mut words = line.split_whitespace();
    match (words.next(), words.next()) {
        (Some("status"), None) => {
            let status = handle.status()?;
            println!("{status:#?}");
        }
        (Some("merge"), None) => {
            let Some(request) = config.merge_request() else {
                bail!("no endpoints configured, start with --primary and --secondary");
            };
            merge(handle, &request)?;
        }
        (Some("unmerge"), None) => {
            handle.destroy_merge()?;
            println!("unmerged");
        }
        (Some("spatial"), Some(mode @ ("on" | "off"))) => {
            let enabled = mode == "on";
            if !handle.is_merge_active() {
                bail!("spatial audio needs an active merge");
            }
            if handle.toggle_spatial(enabled)? {
                println!("spatial {mode}");
            } else {
                println!("spatial already {mode}");
            }
            config.merge.spatial_audio = enabled;
        }
        (Some("save"), None) => {
            config.merge.enabled = handle.is_merge_active();
            config
                .save(config_path)
                .with_context(|| format!("saving {}", config_path.display()))?;
            println!("saved {}", config_path.display());
        }
        (Some("quit" | "exit"), None) => return Ok(false),
        _ => println!("commands: status, merge, unmerge, spatial on|off, save, quit"),
    }
    Ok(true)
}
