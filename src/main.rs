//! Command-line entry point for the Sengon ML pipeline.
//!
//! One invocation runs one mode:
//! - `--train` fetches the last week of readings, trains the growth,
//!   health and anomaly models and writes them to the model directory
//! - `--predict` loads those artifacts and runs every predictor on the
//!   most recent readings of one device
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `DB_POOL_MAX` (optional) – maximum number of DB connections (default: 5)
//! - `MODEL_DIR` (optional) – artifact directory (default: `models`)
//! - `LOG_FILE` (optional) – log file path (default: `ml_pipeline.log`)
//! - `ML_LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `ML_SPAN_EVENTS` (optional) – span event mode for tracing
use std::{env, fs::OpenOptions, path::Path, process::ExitCode, sync::Mutex};

use anyhow::{Context, Result};
use clap::{ArgGroup, CommandFactory, Parser};
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sengon_ml::{config, PgReadingSource, PipelineError, SengonPipeline};

// ---

#[derive(Debug, Parser)]
#[command(name = "sengon-ml", version, about = "Sengon ML Pipeline")]
#[command(group(ArgGroup::new("mode").args(["train", "predict"])))]
struct Cli {
    // ---
    /// Train all models
    #[arg(long)]
    train: bool,

    /// Run predictions
    #[arg(long)]
    predict: bool,

    /// Specific device ID to process
    #[arg(long)]
    device_id: Option<String>,

    /// Hourly steps to forecast
    #[arg(long, default_value_t = 24)]
    steps_ahead: usize,

    /// Directory holding the model artifacts
    #[arg(long, env = "MODEL_DIR")]
    model_dir: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // ---
    dotenv().ok();
    let cli = Cli::parse();

    if !cli.train && !cli.predict {
        // Printing help can only fail on a closed stdout
        let _ = Cli::command().print_help();
        return ExitCode::SUCCESS;
    }

    if let Err(e) = init_tracing(&config::log_file_from_env()) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            if !already_reported(&e) {
                tracing::error!("{:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

/// Too little data is logged as a warning where it is detected.
fn already_reported(e: &anyhow::Error) -> bool {
    // ---
    matches!(
        e.downcast_ref::<PipelineError>(),
        Some(PipelineError::InsufficientRows { .. })
    )
}

async fn run(cli: Cli) -> Result<bool> {
    // ---
    let mut cfg = config::load_from_env()?;
    if let Some(dir) = cli.model_dir {
        cfg.model_dir = dir.into();
    }
    cfg.log_config();

    tracing::info!("Attempting to connect to database: {}", config::mask_db_url(&cfg.db_url));

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .with_context(|| format!("Failed to connect to database '{}'", config::mask_db_url(&cfg.db_url)))?;

    tracing::info!("Successfully connected to database");

    let mut pipeline = SengonPipeline::new(PgReadingSource::new(pool), cfg.pipeline_config());
    let device_id = cli.device_id.as_deref();

    if cli.train {
        let report = pipeline.run_training_pipeline(device_id).await?;
        if report.is_success() {
            println!("Training completed successfully");
        } else {
            println!("Training failed");
        }
        return Ok(report.is_success());
    }

    let report = pipeline
        .run_prediction(device_id, cli.steps_ahead)
        .await
        .context("Failed to run predictions")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(true)
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// Two layers share one filter:
/// - a console layer with target, file and line number output, colour
///   controlled by TTY detection and the `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - a plain-text layer appending to `log_file`
///
/// Span event emission mode is controlled by the `ML_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
///
/// The level comes from `RUST_LOG` when set, otherwise `ML_LOG_LEVEL`.
fn init_tracing(log_file: &Path) -> Result<()> {
    // ---
    let span_events = || match env::var("ML_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to ML_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("ML_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events())
        .with_ansi(use_color)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(span_events())
        .with_ansi(false)
        .with_writer(Mutex::new(file));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}
