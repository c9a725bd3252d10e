#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::doc_markdown,
    clippy::uninlined_format_args,
    clippy::match_same_arms,
    clippy::needless_pass_by_value,
    clippy::cast_possible_truncation
)]

mod backends;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use serde::Serialize;

use canopy::services::CancellationToken;
use canopy::{
    AnalysisConfig, AnalysisError, AnalysisPipeline, ContourExtractor, Coordinate,
    DensityClassifier, ForecastAdapter, FsArtifactStore, HistoricalSeries, Mask, RgbFrame,
    StationCatalog,
};

/// Canopy vegetation analytics CLI
#[derive(Parser)]
#[command(name = "canopy")]
#[command(about = "Canopy CLI tools - analyze imagery, match stations, and inspect configuration")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (toml, yaml or json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "json")]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full analysis on an image
    Analyze {
        /// Input image file
        image: PathBuf,
        /// Observation longitude in decimal degrees
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
        /// Observation latitude in decimal degrees
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        /// Station catalog CSV
        #[arg(long)]
        stations: PathBuf,
        /// Historical coverage CSV
        #[arg(long)]
        history: PathBuf,
        /// Precomputed segmentation mask (white = foreground)
        #[arg(long)]
        mask: Option<PathBuf>,
        /// Segmentation ONNX model, overrides the config
        #[arg(long)]
        segmentation_model: Option<PathBuf>,
        /// Forecast ONNX model, overrides the config
        #[arg(long)]
        forecast_model: Option<PathBuf>,
        /// Artifact directory, overrides the config
        #[arg(long)]
        store: Option<PathBuf>,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Classify vegetation density of an image
    Density {
        /// Input image file
        image: PathBuf,
        /// Write the colorized image here
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Use the legacy green-channel thresholds
        #[arg(long)]
        fixed: bool,
    },
    /// Draw the outer boundaries of a mask over an image
    Contour {
        /// Reference image
        image: PathBuf,
        /// Mask image (white = foreground)
        mask: PathBuf,
        /// Output image
        #[arg(short, long, default_value = "contour.png")]
        output: PathBuf,
    },
    /// Find the station nearest to a coordinate
    Nearest {
        /// Station catalog CSV
        #[arg(long)]
        stations: PathBuf,
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
    },
    /// Forecast coverage for one station
    Forecast {
        /// Historical coverage CSV
        #[arg(long)]
        history: PathBuf,
        /// Station index (catalog row)
        #[arg(long)]
        station: usize,
        /// Forecast ONNX model, overrides the config
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config,
}

#[derive(ValueEnum, Clone, Copy)]
enum OutputFormat {
    Json,
    Yaml,
    Toml,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.quiet {
        log::LevelFilter::Error
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if args.quiet && args.verbose {
        warn!("Both --quiet and --verbose specified, using --quiet");
    }

    if let Err(e) = run(args) {
        error!("Command failed: {:#}", e);
        process::exit(exit_code(&e));
    }
}

/// 1 for bad input or data, 2 for everything else
fn exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<AnalysisError>() {
        Some(err) if err.is_input_error() => 1,
        Some(_) => 2,
        None if e.downcast_ref::<std::io::Error>().is_some() => 1,
        None => 2,
    }
}

fn run(args: Args) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let format = args.format;

    match args.command {
        Commands::Analyze {
            image,
            lon,
            lat,
            stations,
            history,
            mask,
            segmentation_model,
            forecast_model,
            store,
            timeout,
        } => {
            let mut config = config;
            if let Some(path) = segmentation_model {
                config.segmentation.model_path = Some(path);
            }
            if let Some(path) = forecast_model {
                config.forecast.model_path = Some(path);
            }
            if let Some(root) = store {
                config.storage.root = root;
            }
            let request = AnalyzeRequest {
                image,
                location: Coordinate::new(lon, lat),
                stations,
                history,
                mask,
                timeout: timeout.map(Duration::from_secs),
            };
            cmd_analyze(config, request, format)
        }
        Commands::Density {
            image,
            output,
            fixed,
        } => cmd_density(config, &image, output.as_deref(), fixed, format),
        Commands::Contour {
            image,
            mask,
            output,
        } => cmd_contour(config, &image, &mask, &output),
        Commands::Nearest { stations, lon, lat } => {
            cmd_nearest(&stations, Coordinate::new(lon, lat), format)
        }
        Commands::Forecast {
            history,
            station,
            model,
        } => cmd_forecast(config, &history, station, model, format),
        Commands::Config => emit(&config, format),
    }
}

fn load_config(path: Option<&Path>) -> Result<AnalysisConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Ok(AnalysisConfig::from_path(path)?)
        }
        None => Ok(AnalysisConfig::default()),
    }
}

struct AnalyzeRequest {
    image: PathBuf,
    location: Coordinate,
    stations: PathBuf,
    history: PathBuf,
    mask: Option<PathBuf>,
    timeout: Option<Duration>,
}

fn cmd_analyze(config: AnalysisConfig, request: AnalyzeRequest, format: OutputFormat) -> Result<()> {
    info!("Analyzing {}", request.image.display());

    let frame = RgbFrame::open(&request.image)?;
    let catalog = StationCatalog::from_csv_path(&request.stations)
        .with_context(|| format!("Failed to load stations from {}", request.stations.display()))?;
    let history = HistoricalSeries::from_csv_path(&request.history)
        .with_context(|| format!("Failed to load history from {}", request.history.display()))?;

    let segmentation = backends::segmentation(
        request.mask.as_deref(),
        config.segmentation.model_path.as_deref(),
        config.segmentation.foreground_class,
    )?;
    let forecast = backends::forecast(config.forecast.model_path.as_deref())?;
    let store = Arc::new(FsArtifactStore::new(&config.storage.root));

    let pipeline = AnalysisPipeline::new(
        config,
        segmentation,
        forecast,
        store,
        Arc::new(catalog),
        Arc::new(history),
    )?;

    let cancel = request
        .timeout
        .map_or_else(CancellationToken::new, CancellationToken::with_timeout);

    let spinner = create_spinner("Analyzing image");
    let result = pipeline.analyze(&frame, request.location, &cancel);
    spinner.finish_and_clear();

    let report = result?;
    if report.artifacts.contour.is_none() {
        warn!("Contour artifact was skipped");
    }
    emit(&report, format)
}

fn cmd_density(
    config: AnalysisConfig,
    image: &Path,
    output: Option<&Path>,
    fixed: bool,
    format: OutputFormat,
) -> Result<()> {
    let frame = RgbFrame::open(image)?;

    let (colorized, report) = if fixed {
        warn!("Using the legacy fixed-threshold classifier");
        legacy_density(&frame)
    } else {
        DensityClassifier::new(config.density).classify_frame(&frame)?
    };

    if let Some(path) = output {
        colorized.save_png(path)?;
        info!("Wrote {}", path.display());
    }
    emit(&report, format)
}

#[allow(deprecated)]
fn legacy_density(frame: &RgbFrame) -> (RgbFrame, canopy::DensityReport) {
    canopy::density::classify_fixed_thresholds(frame)
}

fn cmd_contour(config: AnalysisConfig, image: &Path, mask: &Path, output: &Path) -> Result<()> {
    let reference = RgbFrame::open(image)?;
    let mask_frame = RgbFrame::open(mask)?.resized_nearest(reference.width(), reference.height());

    let labels = mask_frame.non_black_mask().mapv(u8::from);
    let mask = Mask::from_labels(labels)?;

    let overlay = ContourExtractor::new(config.contour).extract(&mask, &reference)?;
    overlay.save_png(output)?;
    info!("Wrote {}", output.display());
    Ok(())
}

fn cmd_nearest(stations: &Path, location: Coordinate, format: OutputFormat) -> Result<()> {
    let catalog = StationCatalog::from_csv_path(stations)?;
    let found = catalog.nearest(location)?;
    emit(&found, format)
}

fn cmd_forecast(
    config: AnalysisConfig,
    history: &Path,
    station: usize,
    model: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let history = HistoricalSeries::from_csv_path(history)?;
    let model = model.or(config.forecast.model_path);
    let adapter = ForecastAdapter::new(backends::forecast(model.as_deref())?, config.forecast.window);

    let result = adapter.forecast(station, &history, &CancellationToken::new())?;
    emit(&result, format)
}

fn emit<T: Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    let output = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
        OutputFormat::Toml => toml::to_string_pretty(value)?,
    };
    println!("{}", output);
    Ok(())
}

fn create_spinner(message: &'static str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} [{elapsed}] {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}
