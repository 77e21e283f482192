//! `bwforecast` - command-line front end for the bandwidth quota forecaster.
//!
//! Loads configuration, runs one forecast against Prometheus and prints the
//! resulting chart series, or evaluates the control law for a single reading.

// ============================================================================
// SECTION 1: IMPORTS
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use bandwidth_forecast::{
    init_logging, CalendarCycle, ConfigError, Dataset, ForecastConfig, ForecastError, ForecastPipeline,
    QuotaModel, QuotaParameters, TimeSeries, Timestamp, ENGINE_FULL_NAME, ENGINE_VERSION,
};

// ============================================================================
// SECTION 2: CLI ARGUMENT PARSER
// ============================================================================

/// Bandwidth quota forecaster
#[derive(Parser, Debug)]
#[command(
    name = "bwforecast",
    author = "AIOps Team",
    version,
    about = "Monthly bandwidth quota forecast and speed limits from Prometheus counters",
    long_about = "Queries a cumulative byte counter and its rate from Prometheus, keeps each \
                  series to the billing month its cycle tag names, and derives the expected \
                  usage line and the highest transfer rate that stays under the monthly cap."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "bwforecast.toml", env = "BWFORECAST_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "BWFORECAST_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Subcommand to run (default: forecast)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Query Prometheus and print the forecast dataset
    Forecast(ForecastArgs),

    /// Evaluate the control law for one usage reading
    Limit {
        /// Bytes consumed so far in the current cycle
        #[arg(short, long)]
        usage: f64,

        /// Instant to evaluate at (RFC 3339, default: now)
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        #[command(flatten)]
        quota: QuotaArgs,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

#[derive(Args, Debug, Default)]
pub struct ForecastArgs {
    /// Prometheus address
    #[arg(long)]
    backend: Option<String>,

    /// Query resolution, e.g. "6h"
    #[arg(long)]
    step: Option<String>,

    /// First day of the range (YYYY-MM-DD)
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last day of the range (YYYY-MM-DD)
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(flatten)]
    quota: QuotaArgs,
}

/// Control-law overrides shared by `forecast` and `limit`
#[derive(Args, Debug, Default)]
pub struct QuotaArgs {
    /// Monthly cap in bytes
    #[arg(long)]
    cap: Option<f64>,

    /// Contracted line rate in bytes/second
    #[arg(long)]
    peak_rate: Option<f64>,

    /// Smoothing horizon in seconds
    #[arg(long)]
    grace: Option<f64>,

    /// Extra allowance at cycle start in bytes
    #[arg(long)]
    early_shift: Option<f64>,
}

impl QuotaArgs {
    fn apply(&self, quota: &mut QuotaParameters) {
        if let Some(cap) = self.cap {
            quota.cap = cap;
        }
        if let Some(peak_rate) = self.peak_rate {
            quota.peak_rate = peak_rate;
        }
        if let Some(grace) = self.grace {
            quota.grace_secs = grace;
        }
        if let Some(early_shift) = self.early_shift {
            quota.early_shift_bytes = early_shift;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

// ============================================================================
// SECTION 3: CLI HANDLER FUNCTIONS
// ============================================================================

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> Result<(), ForecastError> {
    println!("Validating configuration file: {}", config_path.display());

    match ForecastConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Backend: {}", config.backend.base_url());
            println!("  • Usage metric: {}", config.query.metric);
            println!("  • Cycle label: {}", config.query.cycle_label);
            println!("  • Sampling interval: {}", config.sampling.step()?);
            println!("  • Cycle timezone: {:?}", config.cycle.timezone);
            println!("  • Cap: {:.0} bytes", config.quota.cap);
            println!("  • Peak rate: {:.0} bytes/s", config.quota.peak_rate);
            println!("  • Grace: {}s", config.quota.grace_secs);
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(ForecastError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> Result<(), ForecastError> {
    let config_str = ForecastConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("📶 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  • Calendar-month billing cycles (local or UTC)");
    println!("  • Expected-usage forecast with front-loaded allowance");
    println!("  • Speed limit clamped to the contracted peak rate");
    println!("  • Prometheus range queries");
}

/// Config file if present, defaults otherwise; environment overrides apply
/// either way. The flag tells whether the file was found.
fn load_config(path: &Path) -> Result<(ForecastConfig, bool), ConfigError> {
    if path.exists() {
        Ok((ForecastConfig::load(path)?, true))
    } else {
        Ok((ForecastConfig::from_env()?, false))
    }
}

fn apply_forecast_args(config: &mut ForecastConfig, args: &ForecastArgs) -> AnyhowResult<()> {
    if let Some(backend) = &args.backend {
        config.backend.url = backend.clone();
    }
    if let Some(step) = &args.step {
        config.sampling.interval =
            humantime::parse_duration(step).with_context(|| format!("Invalid --step '{}'", step))?;
    }
    if args.start.is_some() {
        config.range.start = args.start;
    }
    if args.end.is_some() {
        config.range.end = args.end;
    }
    args.quota.apply(&mut config.quota);
    Ok(())
}

async fn handle_forecast(mut config: ForecastConfig, args: ForecastArgs) -> AnyhowResult<()> {
    apply_forecast_args(&mut config, &args)?;
    config.validate()?;

    let sampling = config.sampling.step()?;
    let range = config.range.resolve(Utc::now())?;

    info!(
        target: "bwforecast::cli",
        backend = %config.backend.base_url(),
        start = %range.start().to_rfc3339(),
        end = %range.end().to_rfc3339(),
        step = %sampling,
        "Running forecast"
    );

    let pipeline = ForecastPipeline::from_config(&config)?;
    let dataset = pipeline.build_dataset(&config.quota, sampling, &range).await?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&dataset.charts())?),
        OutputFormat::Text => print_dataset(&dataset),
    }
    Ok(())
}

fn print_dataset(dataset: &Dataset) {
    if dataset.is_empty() {
        println!("No cycles in range.");
        return;
    }

    println!(
        "{:<8} {:>8} {:>18} {:>18} {:>14} {:>14}",
        "cycle", "samples", "usage (B)", "usage limit (B)", "speed (B/s)", "limit (B/s)"
    );
    for (tag, cycle) in dataset.cycles() {
        let latest = |series: &TimeSeries| {
            series
                .last()
                .map(|s| format!("{:.0}", s.value))
                .unwrap_or_else(|| "-".to_string())
        };
        println!(
            "{:<8} {:>8} {:>18} {:>18} {:>14} {:>14}",
            tag.to_string(),
            cycle.usage.len(),
            latest(&cycle.usage),
            latest(&cycle.usage_limit),
            latest(&cycle.rate),
            latest(&cycle.speed_limit),
        );
    }
}

fn handle_limit(mut config: ForecastConfig, usage: f64, at: Option<DateTime<Utc>>, quota: &QuotaArgs) -> AnyhowResult<()> {
    quota.apply(&mut config.quota);
    config.quota.validate()?;
    if !usage.is_finite() || usage < 0.0 {
        anyhow::bail!("--usage must be a finite, non-negative byte count");
    }

    let instant = at.map(Timestamp::from_datetime).unwrap_or_else(Timestamp::now);
    let calendar = CalendarCycle::new(config.cycle.timezone);
    let model = QuotaModel::new(config.quota, calendar);
    let window = calendar.window_for(instant);
    let point = model.evaluate(instant, usage);

    println!("Instant:          {}", instant);
    println!(
        "Cycle:            {} ({:.1}% elapsed)",
        calendar.tag_for(instant),
        window.elapsed_secs / window.duration_secs * 100.0
    );
    println!("Usage:            {:.0} B", usage);
    println!("Expected usage:   {:.0} B", point.expected_usage);
    println!("Speed limit:      {:.0} B/s", point.speed_limit);
    Ok(())
}

// ============================================================================
// SECTION 4: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let Cli {
        config: config_path,
        log_level,
        debug,
        command,
    } = Cli::parse();

    let command = command.unwrap_or_else(|| Commands::Forecast(ForecastArgs::default()));

    // Subcommands that don't need logging or a loaded config
    match command {
        Commands::Version => {
            handle_version();
            return Ok(());
        }
        Commands::GenerateConfig { output } => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Commands::Validate { verbose } => {
            handle_validate(&config_path, verbose)?;
            return Ok(());
        }
        command => {
            let (config, found) = load_config(&config_path)
                .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

            let mut logging_config = config.logging.clone();
            if let Some(level) = log_level {
                logging_config.level = level;
            }
            if debug {
                logging_config.level = "debug".into();
            }
            init_logging(&logging_config)?;

            if !found {
                warn!(target: "bwforecast::cli", "Config file not found at {}, using defaults", config_path.display());
            }

            match command {
                Commands::Limit { usage, at, quota } => handle_limit(config, usage, at, &quota),
                Commands::Forecast(args) => handle_forecast(config, args).await,
                _ => Ok(()),
            }
        }
    }
}
