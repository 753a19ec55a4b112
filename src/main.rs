//! svgbatch CLI - batch raster-to-SVG converter
//!
//! Converts folders of PNG/JPEG images to SVG with live progress, keyboard
//! pause/resume/cancel, and a ZIP archive of the results.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use svgbatch::config::{default_config_path, LoggingConfig};
use svgbatch::parallel::{eta_text, speed_text, FolderId, FolderStats, GlobalProgress, ProgressEvent};
use svgbatch::processing::{read_folder, save_zip, VtracerBackend};
use svgbatch::{
    init_with_config, BatchScheduler, ConcurrencyScope, Config, ControlAction, ConversionMode,
    ConversionSettings, FileStatus, FinalReport, FolderStatus, Selection, StateStore,
};

/// svgbatch - Batch raster-to-SVG converter
#[derive(Parser)]
#[command(
    name = "svgbatch",
    version,
    about = "Concurrent batch PNG/JPEG to SVG converter",
    long_about = "svgbatch converts folders of PNG and JPEG images to SVG vector graphics. \
                  Each input directory becomes a folder that converts in concurrency-bounded \
                  waves; runs can be paused, resumed and cancelled, and results are collected \
                  into a ZIP archive."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short = 'Q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

/// Available subcommands
#[derive(Subcommand)]
enum Commands {
    /// Convert one or more directories to SVG
    Convert(ConvertArgs),
    /// List available conversion profiles
    Profiles {
        /// Show detailed profile information
        #[arg(long)]
        detailed: bool,
    },
    /// Validate configuration file
    Config {
        /// Configuration file to validate
        file: PathBuf,
    },
    /// Generate example configuration file
    ExampleConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Use YAML format instead of TOML
        #[arg(long)]
        yaml: bool,
    },
}

#[derive(Args)]
struct ConvertArgs {
    /// Input directories; each becomes one folder
    #[arg(required = true, value_name = "DIR")]
    inputs: Vec<PathBuf>,

    /// Output ZIP archive
    #[arg(short, long, default_value = "svgbatch.zip", value_name = "FILE")]
    output: PathBuf,

    /// Conversion mode
    #[arg(short, long, value_enum)]
    mode: Option<CliMode>,

    /// Curve smoothness (0.1-2.0)
    #[arg(short, long, value_name = "FACTOR")]
    smoothness: Option<f32>,

    /// Noise reduction level (0-3)
    #[arg(short, long, value_name = "LEVEL")]
    noise_reduction: Option<u8>,

    /// Files converted at once per folder (1-8)
    #[arg(short = 'j', long, value_name = "COUNT")]
    concurrency: Option<usize>,

    /// Downscale images wider than WIDTH before tracing
    #[arg(long, value_name = "WIDTH")]
    downscale: Option<u32>,

    /// Apply the concurrency limit across all folders
    #[arg(long)]
    global_limit: bool,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "SVGBATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Conversion profile name
    #[arg(short, long, value_name = "NAME")]
    profile: Option<String>,

    /// Retry failed files once after the run
    #[arg(long)]
    retry_failed: bool,

    /// Keyboard control: Space pause/resume, Esc cancel, d save archive
    #[arg(long)]
    keys: bool,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

/// CLI-compatible conversion mode
#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliMode {
    #[value(name = "blackwhite")]
    BlackWhite,
    Posterize,
}

impl From<CliMode> for ConversionMode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::BlackWhite => ConversionMode::BlackWhite,
            CliMode::Posterize => ConversionMode::Posterize,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Convert(ref args) => run_convert(args, cli.verbose, cli.quiet).await,
        Commands::Profiles { detailed } => {
            show_profiles(detailed);
            Ok(())
        }
        Commands::Config { ref file } => validate_config_file(file),
        Commands::ExampleConfig { ref output, yaml } => {
            generate_example_config(output.as_deref(), yaml)
        }
    };

    if let Err(e) = result {
        eprintln!("{}: {:#}", style("Error").red().bold(), e);
        process::exit(1);
    }
}

/// Load configuration and fold in profile and CLI overrides
fn resolve_settings(args: &ConvertArgs) -> anyhow::Result<(Config, ConversionMode, ConversionSettings)> {
    let config = match &args.config {
        Some(path) => {
            let config = Config::from_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
            config.validate()?;
            config
        }
        None => Config::default(),
    };

    let (mut mode, mut settings) = match &args.profile {
        Some(name) => {
            let profile = config.get_profile(name)?;
            (profile.mode, profile.settings.clone())
        }
        None => (config.convert.mode, config.convert.settings.clone()),
    };

    if let Some(cli_mode) = args.mode {
        mode = cli_mode.into();
    }
    if let Some(smoothness) = args.smoothness {
        settings = settings.smoothness(smoothness);
    }
    if let Some(level) = args.noise_reduction {
        settings = settings.noise_reduction(level);
    }
    if let Some(concurrency) = args.concurrency {
        settings = settings.concurrency(concurrency);
    }
    if let Some(width) = args.downscale {
        settings = settings.downscale(width);
    }
    if args.global_limit {
        settings = settings.scope(ConcurrencyScope::Global);
    }

    settings.validate()?;
    Ok((config, mode, settings))
}

async fn run_convert(args: &ConvertArgs, verbose: bool, quiet: bool) -> anyhow::Result<()> {
    let (config, mode, settings) = resolve_settings(args)?;

    let logging = LoggingConfig {
        level: if quiet {
            "error".to_string()
        } else if verbose {
            "debug".to_string()
        } else {
            config.logging.level.clone()
        },
        ..config.logging.clone()
    };
    init_with_config(&Config {
        logging,
        ..config.clone()
    })?;

    let store = Arc::new(StateStore::new(config.limits.clone()));
    for dir in &args.inputs {
        let upload = read_folder(dir)
            .await
            .with_context(|| format!("Failed to read {}", dir.display()))?;
        let report = store.add_folder(upload, mode)?;

        for rejected in &report.rejected {
            warn!("Skipped {}: {}", rejected.name, rejected.reason);
        }
        if report.truncated > 0 {
            warn!(
                "Folder '{}': {} files over the per-folder limit were left out",
                report.name, report.truncated
            );
        }
        info!("Queued {} files from '{}'", report.accepted, report.name);
    }

    let scheduler = Arc::new(BatchScheduler::with_tracer(
        Arc::clone(&store),
        Arc::new(VtracerBackend::new()),
    ));

    info!(
        "Mode: {}, smoothness {:.1}, noise reduction {}, concurrency {} ({:?})",
        mode, settings.smoothness, settings.noise_reduction, settings.concurrency, settings.concurrency_scope
    );

    let stop = Arc::new(AtomicBool::new(false));
    let signals = tokio::spawn(cancel_on_ctrl_c(Arc::clone(&scheduler)));
    let keys = if args.keys {
        Some(tokio::spawn(handle_keys(
            Arc::clone(&scheduler),
            args.output.clone(),
            Arc::clone(&stop),
        )))
    } else {
        None
    };

    let show_progress = !args.json && !quiet;
    let mut stats = run_with_progress(&scheduler, settings.clone(), show_progress).await?;

    if args.retry_failed && stats.failed > 0 && !scheduler.was_cancelled() {
        let requeued = store.retry_failed(None)?;
        info!("Retrying {} failed files", requeued);
        stats = run_with_progress(&scheduler, settings, show_progress).await?;
    }

    stop.store(true, Ordering::Release);
    signals.abort();
    if let Some(keys) = keys {
        let _ = keys.await;
    }

    let entries = store.snapshot().archive_entries(Selection::All, None);
    let archive = if entries.is_empty() {
        warn!("No files converted; archive not written");
        None
    } else {
        save_zip(&args.output, &entries)
            .await
            .with_context(|| format!("Failed to write {}", args.output.display()))?;
        Some(args.output.clone())
    };

    let report = FinalReport::from_stats(&stats, scheduler.was_cancelled());
    if args.json {
        print_json(&store, &report, archive.as_deref())?;
    } else if !quiet {
        print_report(&report, archive.as_deref());
    }

    Ok(())
}

/// Run once, rendering progress bars from the event stream
async fn run_with_progress(
    scheduler: &Arc<BatchScheduler>,
    settings: ConversionSettings,
    show_progress: bool,
) -> anyhow::Result<svgbatch::GlobalStats> {
    let renderer = show_progress.then(|| {
        let snapshot = scheduler.store().snapshot();
        let folders = snapshot
            .folders
            .iter()
            .map(|folder| (folder.id, folder.name.clone(), folder.count(FileStatus::Queued)))
            .collect::<Vec<_>>();
        tokio::spawn(render_progress(
            scheduler.subscribe(),
            Arc::clone(scheduler.store()),
            folders,
        ))
    });

    let stats = scheduler.start_all(settings).await?;

    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }
    Ok(stats)
}

async fn render_progress(
    mut events: broadcast::Receiver<ProgressEvent>,
    store: Arc<StateStore>,
    folders: Vec<(FolderId, String, usize)>,
) {
    let started = Instant::now();
    let multi = MultiProgress::new();
    let bar_style = ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:<16.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");

    let bars: HashMap<FolderId, ProgressBar> = folders
        .into_iter()
        .filter(|(_, _, queued)| *queued > 0)
        .map(|(id, name, queued)| {
            let bar = multi.add(ProgressBar::new(queued as u64));
            bar.set_style(bar_style.clone());
            bar.set_prefix(name);
            bar.enable_steady_tick(Duration::from_millis(120));
            (id, bar)
        })
        .collect();

    let queued: u64 = bars.values().filter_map(ProgressBar::length).sum();
    let overall = (bars.len() > 1).then(|| {
        let bar = multi.add(ProgressBar::new(queued));
        bar.set_style(bar_style.clone());
        bar.set_prefix("all folders");
        bar
    });

    loop {
        match events.recv().await {
            Ok(ProgressEvent::FileFinished { folder, name, error, .. }) => {
                if let Some(overall) = &overall {
                    overall.inc(1);
                }
                if let Some(bar) = bars.get(&folder) {
                    bar.inc(1);
                    if let Some(error) = error {
                        bar.println(format!("{} {}: {}", style("✗").red(), name, error));
                    }
                }
            }
            Ok(ProgressEvent::WaveCompleted {
                folder,
                speed,
                eta_seconds,
                ..
            }) => {
                if let Some(bar) = bars.get(&folder) {
                    bar.set_message(format!("{} · ETA {}", speed_text(speed), eta_text(eta_seconds)));
                }
                if let Some(overall) = &overall {
                    let progress = GlobalProgress::derive(&store.snapshot().folders, started.elapsed());
                    overall.set_message(format!("{} · ETA {}", progress.speed_text(), progress.eta_text()));
                }
            }
            Ok(ProgressEvent::FolderCompleted { folder }) => {
                if let Some(bar) = bars.get(&folder) {
                    bar.finish_with_message("done");
                }
            }
            Ok(ProgressEvent::Paused) => {
                for bar in bars.values().filter(|bar| !bar.is_finished()) {
                    bar.set_message("paused (Space to resume)");
                }
            }
            Ok(ProgressEvent::Resumed) => {
                for bar in bars.values().filter(|bar| !bar.is_finished()) {
                    bar.set_message("");
                }
            }
            Ok(ProgressEvent::Cancelled) => {
                for bar in bars.values().filter(|bar| !bar.is_finished()) {
                    bar.abandon_with_message("cancelled");
                }
            }
            Ok(ProgressEvent::RunFinished { .. }) | Err(broadcast::error::RecvError::Closed) => break,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Progress display skipped {} events", skipped);
            }
        }
    }

    for bar in bars.values().chain(overall.as_ref()).filter(|bar| !bar.is_finished()) {
        bar.abandon();
    }
}

async fn cancel_on_ctrl_c(scheduler: Arc<BatchScheduler>) {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        if scheduler.cancel() {
            eprintln!("{}: cancelling, finished files are kept", style("Interrupted").yellow().bold());
        }
    }
}

/// Restores the terminal when dropped
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> std::io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

enum KeyCommand {
    Action(ControlAction),
    Interrupt,
}

async fn handle_keys(scheduler: Arc<BatchScheduler>, output: PathBuf, stop: Arc<AtomicBool>) {
    let (sender, mut commands) = mpsc::unbounded_channel();

    let reader = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let _raw = RawModeGuard::enable()?;
        while !stop.load(Ordering::Acquire) {
            if !event::poll(Duration::from_millis(100))? {
                continue;
            }
            if let Event::Key(key) = event::read()? {
                // Raw mode swallows SIGINT, so Ctrl-C arrives as a key
                let command = if key.code == KeyCode::Char('c')
                    && key.modifiers.contains(KeyModifiers::CONTROL)
                {
                    Some(KeyCommand::Interrupt)
                } else {
                    ControlAction::from_key_event(&key).map(KeyCommand::Action)
                };

                if let Some(command) = command {
                    if sender.send(command).is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    });

    while let Some(command) = commands.recv().await {
        match command {
            KeyCommand::Action(ControlAction::StartPause) => {
                scheduler.pause_resume();
            }
            KeyCommand::Action(ControlAction::Cancel) | KeyCommand::Interrupt => {
                scheduler.cancel();
            }
            KeyCommand::Action(ControlAction::Download) => {
                let entries = scheduler.store().snapshot().archive_entries(Selection::All, None);
                match save_zip(&output, &entries).await {
                    Ok(count) => info!("Saved {} converted files to {}", count, output.display()),
                    Err(e) => warn!("Could not save archive: {}", e),
                }
            }
        }
    }

    match reader.await {
        Ok(Err(e)) => warn!("Keyboard control unavailable: {}", e),
        Err(e) => warn!("Keyboard reader failed: {}", e),
        Ok(Ok(())) => {}
    }
}

fn print_report(report: &FinalReport, archive: Option<&Path>) {
    println!();
    if report.cancelled {
        println!("{}", style("Conversion Cancelled").yellow().bold());
    } else {
        println!("{}", style("Conversion Report").bold());
    }
    println!("  {}: {}", style("Converted").green(), report.converted);
    if report.failed > 0 {
        println!("  {}: {}", style("Failed").red(), report.failed);
    }
    println!("  {}: {:.1}%", style("Success rate").cyan(), report.success_rate);
    println!("  {}: {}", style("Time").blue(), report.time_text());
    println!("  {}: {}", style("Average speed").cyan(), report.speed_text());
    if let Some(path) = archive {
        println!("  {}: {}", style("Archive").cyan(), path.display());
    }
}

#[derive(Serialize)]
struct JsonSummary<'a> {
    report: &'a FinalReport,
    archive: Option<&'a Path>,
    folders: Vec<JsonFolder>,
}

#[derive(Serialize)]
struct JsonFolder {
    name: String,
    status: FolderStatus,
    stats: FolderStats,
    files: Vec<JsonFile>,
}

#[derive(Serialize)]
struct JsonFile {
    name: String,
    path: String,
    status: FileStatus,
    error: Option<String>,
    conversion_ms: Option<u64>,
}

fn print_json(store: &StateStore, report: &FinalReport, archive: Option<&Path>) -> anyhow::Result<()> {
    let snapshot = store.snapshot();
    let folders = snapshot
        .folders
        .into_iter()
        .map(|folder| JsonFolder {
            name: folder.name,
            status: folder.status,
            stats: folder.stats,
            files: folder
                .files
                .into_iter()
                .map(|file| JsonFile {
                    name: file.name,
                    path: file.path_in_folder,
                    status: file.status,
                    error: file.error,
                    conversion_ms: file
                        .conversion_time
                        .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
                })
                .collect(),
        })
        .collect();

    let summary = JsonSummary {
        report,
        archive,
        folders,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Show available profiles
fn show_profiles(detailed: bool) {
    println!("{}", style("Available Conversion Profiles:").bold());
    println!();

    let config = Config::default();
    for (name, profile) in &config.profiles {
        println!("{}", style(name).cyan().bold());
        if detailed {
            println!("  {}", profile.description);
            println!("  mode: {}", profile.mode);
            println!(
                "  smoothness: {:.1}, noise reduction: {}, concurrency: {}",
                profile.settings.smoothness, profile.settings.noise_reduction, profile.settings.concurrency
            );
            if let Some(width) = profile.settings.downscale_limit() {
                println!("  downscale: {}px", width);
            }
            println!();
        }
    }

    if !detailed {
        println!();
        println!("Use {} for detailed information", style("--detailed").dim());
    }
}

/// Validate configuration file
fn validate_config_file(path: &Path) -> anyhow::Result<()> {
    let config = Config::from_file(path)?;
    config.validate()?;

    println!("{}: Configuration file is valid", style("Success").green().bold());
    println!("Profiles: {}", config.profiles.len());
    println!(
        "Limits: {} folders, {} files per folder, {} total",
        config.limits.max_folders, config.limits.max_files_per_folder, config.limits.max_total_files
    );

    Ok(())
}

/// Generate example configuration file
fn generate_example_config(output: Option<&Path>, use_yaml: bool) -> anyhow::Result<()> {
    let path = match output {
        Some(path) => path.to_path_buf(),
        None if use_yaml => default_config_path().with_extension("yaml"),
        None => default_config_path(),
    };

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    if use_yaml && !matches!(extension, "yaml" | "yml") {
        bail!("--yaml requires a .yaml or .yml output path, got {}", path.display());
    }

    Config::default().to_file(&path)?;

    let format = if use_yaml { "YAML" } else { "TOML" };
    println!(
        "{}: Generated example {} configuration: {}",
        style("Success").green().bold(),
        format,
        path.display()
    );

    Ok(())
}
