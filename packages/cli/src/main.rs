#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI for the vector density forecaster.
//!
//! ```text
//! vcom_forecast forecast --data surveillance.csv --region 3 [--days 30] [--model primary] [--config forecast.toml]
//! vcom_forecast regions --data surveillance.csv
//! ```
//!
//! The CSV has the header `region_id,region_name,date,density`. Forecasts
//! are printed to stdout as JSON; logs go to stderr (`RUST_LOG=info`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use vcom_forecast::config::ForecastConfig;
use vcom_forecast::orchestrator::ModelOrchestrator;
use vcom_forecast::provider::CsvSeriesProvider;
use vcom_forecast_models::DEFAULT_HORIZON_DAYS;

#[derive(Parser)]
#[command(
    name = "vcom_forecast",
    about = "Forecast mosquito density per region with a fallback chain of models"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forecast one region and print the result as JSON
    Forecast {
        /// Surveillance CSV export
        #[arg(long)]
        data: PathBuf,
        /// Region ID to forecast
        #[arg(long)]
        region: i64,
        /// Days to forecast (7-365)
        #[arg(long, default_value_t = i64::from(DEFAULT_HORIZON_DAYS))]
        days: i64,
        /// Model family: primary, secondary, or hybrid
        #[arg(long, default_value = "primary")]
        model: String,
        /// TOML config file (defaults are used when omitted)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
    },
    /// List the regions in a surveillance CSV
    Regions {
        /// Surveillance CSV export
        #[arg(long)]
        data: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<ForecastConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => {
            log::info!("Loading config from {}", path.display());
            ForecastConfig::from_file(path)?
        }
        None => ForecastConfig::default_embedded()?,
    }
    .apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init_custom_env("RUST_LOG");
    let cli = Cli::parse();

    match cli.command {
        Commands::Forecast {
            data,
            region,
            days,
            model,
            config,
            pretty,
        } => {
            let config = load_config(config.as_deref())?;
            let provider = Arc::new(CsvSeriesProvider::from_path(&data)?);
            let orchestrator = ModelOrchestrator::new(provider, &config);

            let result = orchestrator.generate_forecast(region, days, &model).await?;

            let json = if pretty {
                serde_json::to_string_pretty(&result)?
            } else {
                serde_json::to_string(&result)?
            };
            println!("{json}");
        }
        Commands::Regions { data } => {
            let provider = CsvSeriesProvider::from_path(&data)?;
            let regions = provider.summary();

            if regions.is_empty() {
                println!("No regions found.");
                return Ok(());
            }

            println!("{:<10} {:<8} NAME", "ID", "POINTS");
            println!("{}", "-".repeat(60));
            for (id, name, count) in &regions {
                println!("{id:<10} {count:<8} {name}");
            }
            println!("\n{} region(s)", regions.len());
        }
    }

    Ok(())
}
