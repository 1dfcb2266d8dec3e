#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the geolocation census.
//!
//! Uses `indicatif-log-bridge` (via [`geocensus_cli_utils::init_logger`])
//! to route `log` output through `indicatif::MultiProgress` so that log
//! lines and the census progress bar never fight for the terminal.

mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use geocensus_geocoder::service_registry::{GeocodingService, all_services};
use geocensus_region::{Region, normalize_key, to_canonical_region};

#[derive(Parser)]
#[command(name = "geocensus", about = "Geolocation census of back-office entities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Geocode the entities of one region, reusing cached coordinates
    Run(run::RunArgs),
    /// List the canonical region names
    Regions,
    /// Show how a region name is normalized and resolved
    Normalize {
        /// Region name as it appears in the data (e.g. "EMILIA ROMAGNA")
        input: String,
    },
    /// List the available geocoding services
    Services,
}

/// One line of the `services` listing.
fn service_row(service: &GeocodingService) -> String {
    format!(
        "{:<12} {:<40} {}ms",
        service.id,
        service.name,
        service.rate_limit_ms()
    )
}

/// Location of the optional configuration file when `--config` is not given.
fn default_config_path() -> Option<PathBuf> {
    let path = PathBuf::from("geocensus.toml");
    path.exists().then_some(path)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = geocensus_cli_utils::init_logger();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run::run(&multi, args).await?,
        Commands::Regions => {
            for region in Region::ALL {
                println!("{region}");
            }
        }
        Commands::Normalize { input } => {
            println!("Normalized: {}", normalize_key(&input));
            match to_canonical_region(&input) {
                Some(region) => println!("Region:     {region}"),
                None => println!("Region:     (not recognised)"),
            }
        }
        Commands::Services => {
            println!("{:<12} {:<40} DELAY", "ID", "NAME");
            println!("{}", "-".repeat(62));
            for service in all_services() {
                println!("{}", service_row(&service));
            }
        }
    }

    Ok(())
}
