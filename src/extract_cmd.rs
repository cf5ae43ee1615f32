//! `harvest extract`: wire config, extractors and state into an
//! [`Orchestrator`] run and print the summary.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::config::Config;
use crate::fetch::{build_client, HttpFetcher};
use crate::models::{ImageSource, Property};
use crate::orchestrator::{ExtractOptions, ExtractionResult, Orchestrator};
use crate::progress::ProgressMode;
use crate::state::StateManager;
use crate::traits::ExtractorRegistry;
use crate::url_guard::UrlValidator;

/// Exit code when any property failed.
pub const EXIT_FAILED: i32 = 1;
/// Exit code when the run was interrupted.
pub const EXIT_CANCELLED: i32 = 130;

/// Which properties to process.
pub enum Selection {
    Addresses(Vec<String>),
    /// Everything listed in `[properties].path`.
    All,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PropertyEntry {
    Address(String),
    Record { address: String },
}

/// Read a JSON array of addresses or `{"address": ...}` objects.
pub fn load_properties(path: &Path) -> Result<Vec<Property>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read properties file: {}", path.display()))?;
    let entries: Vec<PropertyEntry> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse properties file: {}", path.display()))?;
    Ok(entries
        .into_iter()
        .map(|e| match e {
            PropertyEntry::Address(address) | PropertyEntry::Record { address } => {
                Property::new(address)
            }
        })
        .collect())
}

fn select_properties(config: &Config, selection: Selection) -> Result<Vec<Property>> {
    match selection {
        Selection::Addresses(addresses) => Ok(addresses.into_iter().map(Property::new).collect()),
        Selection::All => {
            let props = config.properties.as_ref().ok_or_else(|| {
                anyhow::anyhow!("--all needs [properties].path in the config file")
            })?;
            load_properties(&props.path)
        }
    }
}

/// Run an extraction and return the process exit code.
pub async fn run_extract(
    config: &Config,
    selection: Selection,
    opts: ExtractOptions,
    progress: ProgressMode,
) -> Result<i32> {
    let properties = select_properties(config, selection)?;
    if properties.is_empty() {
        bail!("no properties to extract");
    }

    let validator = Arc::new(UrlValidator::new(&config.safety));
    let client = build_client(&config.orchestrator)?;
    let extractors = ExtractorRegistry::from_config(config, client.clone(), validator.clone())?;
    if extractors.is_empty() {
        bail!("no enabled sources configured");
    }
    let store = StateManager::new(config.storage.metadata_dir(), config.storage.backup_retention)?;
    let fetcher = HttpFetcher::new(client, validator.clone(), &config.orchestrator);

    let orchestrator = Orchestrator::new(config, extractors, store, Arc::new(fetcher))?
        .with_validator(validator)
        .with_progress(progress.reporter());

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing current sources");
            token.cancel();
        }
    });

    let dry_run = opts.dry_run;
    let result = orchestrator.extract_all(properties, opts).await?;
    print_summary(&result, dry_run);

    Ok(if result.cancelled {
        EXIT_CANCELLED
    } else if !result.failed.is_empty() {
        EXIT_FAILED
    } else {
        0
    })
}

fn print_summary(result: &ExtractionResult, dry_run: bool) {
    if dry_run {
        println!("extract (dry-run)");
    } else {
        println!("extract");
    }
    println!("  run: {}", result.run_id);
    println!("  completed: {}", result.completed.len());
    println!("  failed: {}", result.failed.len());
    for f in &result.failed {
        println!("    {}: {}", f.address, f.reason);
    }
    println!("  skipped: {}", result.skipped.len());
    for s in &result.skipped {
        println!("    {}: {}", s.address, s.reason);
    }

    if dry_run {
        for (address, urls) in &result.discovered_urls {
            println!("  {}: {} urls", address, urls.len());
            for url in urls {
                println!("    {}", url);
            }
        }
    } else {
        println!("  images stored: {}", result.images_stored);
        println!("  duplicates skipped: {}", result.duplicates_skipped());
        println!("  invalid images: {}", result.invalid_images);
        println!("  download failures: {}", result.fetch_failures);
    }
    println!("  urls rejected: {}", result.rejected_urls.len());
    println!("  sources used: {}", join_sources(result.sources_used.iter()));
    if !result.sources_blocked.is_empty() {
        println!(
            "  sources blocked: {}",
            join_sources(result.sources_blocked.iter())
        );
    }
    if let Some(count) = result.large_batch_warning {
        println!("  warning: large batch ({} new images)", count);
    }

    if result.cancelled {
        println!("cancelled");
    } else if result.is_success() {
        println!("ok");
    } else {
        println!("failed");
    }
}

fn join_sources<'a>(sources: impl Iterator<Item = &'a ImageSource>) -> String {
    let names: Vec<&str> = sources.map(|s| s.as_str()).collect();
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}
