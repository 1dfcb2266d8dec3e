//! The `run` subcommand: one census over a JSON file of entities.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use geocensus_api::client::GeolocationApiClient;
use geocensus_census::config::CensusConfig;
use geocensus_census::{
    CensusOrchestrator, CensusReport, CensusSelection, EntityCollection, ProgressTracker,
};
use geocensus_cli_utils::{IndicatifProgress, MultiProgress};
use geocensus_entity_models::{Entity, GeocodeQuality};

/// Arguments of `geocensus run`.
#[derive(Args)]
pub struct RunArgs {
    /// JSON array of entities (`code`, `street`, `postalCode`, `city`,
    /// `province`, `region`, or their Italian back-office names)
    #[arg(long)]
    entities: PathBuf,
    /// Region to census (any spelling, e.g. "Emilia Romagna")
    #[arg(long)]
    region: String,
    /// Restrict the census to one province (e.g. "RM")
    #[arg(long)]
    province: Option<String>,
    /// Configuration file (defaults to `./geocensus.toml` when present)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Geocoding service id (overrides the configuration)
    #[arg(long)]
    geocoder: Option<String>,
    /// Write the merged entities to this JSON file
    #[arg(long)]
    output: Option<PathBuf>,
}

/// Runs one census and prints its summary.
///
/// # Errors
///
/// Returns an error if the inputs or configuration cannot be loaded, or
/// the census is refused.
pub async fn run(multi: &MultiProgress, args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = args.config.or_else(super::default_config_path);
    let mut config = CensusConfig::load(config_path.as_deref())?;
    if let Some(geocoder) = args.geocoder {
        config.geocoder.service = geocoder;
    }

    let text = std::fs::read_to_string(&args.entities)?;
    let entities: Vec<Entity> = serde_json::from_str(&text)?;
    log::info!(
        "Loaded {} entities from {}",
        entities.len(),
        args.entities.display()
    );

    let client = config.http_client()?;
    let service = config.service()?;
    let provider = geocensus_geocoder::create_provider(
        &service,
        client.clone(),
        config.rate_limit_override(),
    )?;
    let api = Arc::new(GeolocationApiClient::new(client, &config.api.base_url)?);

    let progress = ProgressTracker::with_callback(IndicatifProgress::census_bar(
        multi,
        "Checking geolocation cache",
    ));
    let orchestrator = Arc::new(
        CensusOrchestrator::new(config.session(), provider, api.clone(), api)
            .with_progress(progress),
    );

    let ctrl_c = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, stopping after the current entity");
                orchestrator.cancel();
            }
        })
    };

    let collection = EntityCollection::new(entities);
    let selection = CensusSelection::new(args.region, args.province);
    let report = orchestrator.run(&selection, &collection).await;
    ctrl_c.abort();
    let report = report?;

    print_summary(&report);

    if let Some(output) = args.output {
        let merged = collection.into_inner();
        std::fs::write(&output, serde_json::to_string_pretty(&merged)?)?;
        log::info!("Wrote {} entities to {}", merged.len(), output.display());
    }

    Ok(())
}

fn print_summary(report: &CensusReport) {
    let progress = report.progress;

    println!();
    println!("Census {}", report.state);
    println!("  Entities:    {}", progress.total);
    println!("  Processed:   {}", progress.current);
    println!("  From cache:  {}", progress.from_cache);
    println!("  Geocoded:    {}", progress.new_geocoded);
    println!("  Failed:      {}", report.failed());

    match &report.saved {
        Some(saved) => println!(
            "  Saved:       {} ({} created, {} updated, {} rejected)",
            saved.success_count, saved.created_count, saved.updated_count, saved.failed_count
        ),
        None if !report.results.is_empty() => println!("  Saved:       no"),
        None => {}
    }

    println!("  Elapsed:     {:.1}s", report.elapsed().as_secs_f64());

    let failed: Vec<_> = report
        .results
        .iter()
        .filter(|r| r.quality() == GeocodeQuality::Failed)
        .collect();
    if !failed.is_empty() {
        println!();
        println!("Not geocoded:");
        for result in failed {
            println!("  {:<12} {}", result.code(), result.address());
        }
    }
}
