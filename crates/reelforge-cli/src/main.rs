//! ReelForge headless harness
//!
//! Probes devices, preloads models, reports cache status, and runs synthetic
//! clip acquisitions against the engine without the generation pipeline.

mod synthetic;

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reelforge_core::core::acquisition::{select_balanced, AcquisitionRequest};
use reelforge_core::core::models::{ComputeType, ModelKind};
use reelforge_core::core::performance::{AcceleratorInfo, DeviceSelector};
use reelforge_core::core::settings::{EngineSettings, SettingsManager};
use reelforge_core::core::{Device, DevicePreference};
use reelforge_core::EngineContext;

use synthetic::{ClipProfile, SimulatedLoader, SyntheticDownloader};

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Headless harness for the ReelForge engine
#[derive(Parser)]
#[command(name = "reelforge")]
#[command(about = "Model cache and clip acquisition harness for ReelForge")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding settings.json
    #[arg(long, default_value = ".reelforge")]
    data_dir: PathBuf,

    /// Also write daily-rotated logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect accelerators and show the selected device
    Device {
        /// Device preference (auto, cuda, cpu)
        #[arg(long)]
        prefer: Option<String>,
    },

    /// Preload models and print the cache status
    Preload {
        /// Models to load (defaults to the configured preload list)
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,

        /// Load one model at a time
        #[arg(long)]
        sequential: bool,

        /// Simulated load time per model
        #[arg(long, default_value_t = 200)]
        load_ms: u64,

        /// Make simulated loads fail on CUDA to exercise the CPU fallback
        #[arg(long)]
        fail_on_cuda: bool,
    },

    /// Print the cache status without loading anything
    Status,

    /// Run a synthetic clip acquisition and print the report
    Simulate {
        /// Total clip seconds to acquire
        #[arg(long, default_value_t = 30.0)]
        target: f64,

        /// Number of search terms
        #[arg(long, default_value_t = 4)]
        terms: usize,

        /// Candidates returned per term
        #[arg(long, default_value_t = 8)]
        per_term: usize,

        /// Chance that a candidate also appears under the next term
        #[arg(long, default_value_t = 0.1)]
        overlap: f64,

        /// Chance that a download fails
        #[arg(long, default_value_t = 0.1)]
        failure_rate: f64,

        #[arg(long, default_value_t = 100)]
        min_latency_ms: u64,

        #[arg(long, default_value_t = 800)]
        max_latency_ms: u64,

        /// Overrides the configured worker count
        #[arg(long)]
        workers: Option<usize>,

        /// Stop starting downloads after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// Keep search result order instead of shuffling
        #[arg(long)]
        no_shuffle: bool,
    },

    /// Show or reset the persisted settings
    Settings {
        /// Delete settings.json and show the defaults
        #[arg(long)]
        reset: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_dir.as_ref())?;

    let manager = SettingsManager::new(cli.data_dir.clone());

    match cli.command {
        Commands::Device { prefer } => {
            let settings = manager.load();
            run_device(&settings, prefer)
        }
        Commands::Preload {
            models,
            sequential,
            load_ms,
            fail_on_cuda,
        } => run_preload(manager.load(), models, sequential, load_ms, fail_on_cuda).await,
        Commands::Status => run_status(manager.load()).await,
        Commands::Simulate {
            target,
            terms,
            per_term,
            overlap,
            failure_rate,
            min_latency_ms,
            max_latency_ms,
            workers,
            deadline_secs,
            no_shuffle,
        } => {
            let mut settings = manager.load();
            if let Some(workers) = workers {
                settings.acquisition.max_workers = workers;
            }
            let profile = ClipProfile {
                terms,
                per_term,
                overlap,
                min_latency_ms,
                max_latency_ms,
                min_duration: 2.0,
                max_duration: 15.0,
                failure_rate,
            };
            run_simulate(settings, profile, target, deadline_secs, !no_shuffle).await
        }
        Commands::Settings { reset } => {
            let settings = if reset {
                manager.reset()?
            } else {
                manager.load()
            };
            print_json(&settings)
        }
    }
}

fn init_tracing(verbose: bool, log_dir: Option<&PathBuf>) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Reports go to stdout, so logs go to stderr
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(cfg!(debug_assertions));

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(dir, "reelforge.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Builds a context with simulated loaders for every known model
fn build_context(
    settings: EngineSettings,
    load_time: Duration,
    fail_on_cuda: bool,
) -> Result<EngineContext> {
    let mut builder = EngineContext::builder(settings.clone());
    for kind in ModelKind::ALL {
        builder = builder.loader(kind, simulated_or_real_loader(&settings, kind, load_time, fail_on_cuda));
    }
    Ok(builder.build()?)
}

#[cfg(feature = "whisper")]
fn simulated_or_real_loader(
    settings: &EngineSettings,
    kind: ModelKind,
    load_time: Duration,
    fail_on_cuda: bool,
) -> Arc<dyn reelforge_core::core::models::ResourceLoader> {
    match (kind, settings.models.models_dir.as_deref()) {
        (ModelKind::Whisper, Some(dir)) => {
            Arc::new(reelforge_core::core::models::WhisperLoader::new(dir))
        }
        _ => Arc::new(SimulatedLoader::new(kind, load_time, fail_on_cuda)),
    }
}

#[cfg(not(feature = "whisper"))]
fn simulated_or_real_loader(
    _settings: &EngineSettings,
    kind: ModelKind,
    load_time: Duration,
    fail_on_cuda: bool,
) -> Arc<dyn reelforge_core::core::models::ResourceLoader> {
    Arc::new(SimulatedLoader::new(kind, load_time, fail_on_cuda))
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceReport {
    preference: DevicePreference,
    selected: Device,
    accelerator: Option<AcceleratorInfo>,
    whisper_compute_type: ComputeType,
}

fn run_device(settings: &EngineSettings, prefer: Option<String>) -> Result<()> {
    let preference = match prefer {
        Some(value) => value
            .parse::<DevicePreference>()
            .map_err(anyhow::Error::msg)?,
        None => settings.models.device_preference(),
    };

    let selector = DeviceSelector::system();
    let selected = selector.select(preference);
    print_json(&DeviceReport {
        preference,
        selected,
        accelerator: selector.accelerator().cloned(),
        whisper_compute_type: ComputeType::resolve(
            settings.models.compute_type_override(),
            selected,
        ),
    })
}

async fn run_preload(
    mut settings: EngineSettings,
    models: Vec<String>,
    sequential: bool,
    load_ms: u64,
    fail_on_cuda: bool,
) -> Result<()> {
    if !models.is_empty() {
        settings.models.preload = models;
    }
    if sequential {
        settings.models.parallel_preload = false;
    }

    let context = build_context(settings, Duration::from_millis(load_ms), fail_on_cuda)?;
    let report = context
        .start_preload()
        .await
        .context("Preload task failed")?;

    #[derive(Serialize)]
    struct Output<'a> {
        report: &'a reelforge_core::core::models::PreloadReport,
        status: reelforge_core::core::models::CacheStatus,
    }
    print_json(&Output {
        report: &report,
        status: context.cache().status().await,
    })?;

    context.shutdown().await;
    Ok(())
}

async fn run_status(settings: EngineSettings) -> Result<()> {
    let context = build_context(settings, Duration::ZERO, false)?;
    print_json(&context.cache().status().await)
}

async fn run_simulate(
    settings: EngineSettings,
    profile: ClipProfile,
    target: f64,
    deadline_secs: Option<u64>,
    shuffle: bool,
) -> Result<()> {
    profile.validate()?;

    let context = build_context(settings, Duration::ZERO, false)?;
    let ceiling = f64::from(context.settings().acquisition.max_clip_duration_secs);

    let groups = profile.generate(&mut rand::thread_rng());
    let candidates = select_balanced(groups, target, ceiling, shuffle);
    info!(
        "Simulating acquisition of {} candidates (target {:.1}s, {:.1}s per clip)",
        candidates.len(),
        target,
        ceiling
    );

    let mut request = AcquisitionRequest::new(target, ceiling);
    if let Some(secs) = deadline_secs {
        request = request.with_deadline(Duration::from_secs(secs));
    }

    let report = context
        .scheduler()
        .run(Arc::new(SyntheticDownloader), candidates, request)
        .await;

    print_json(&report)
}
