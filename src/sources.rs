//! Source listing for `harvest sources` and the `harvest check-url` probe.

use anyhow::Result;
use serde::Serialize;

use crate::config::{Config, SourceKind};
use crate::models::ImageSource;
use crate::url_guard::UrlValidator;

/// One configured source and whether it looks usable.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SourceStatus {
    pub name: String,
    pub source: Option<ImageSource>,
    pub kind: &'static str,
    pub enabled: bool,
    pub healthy: bool,
    pub detail: String,
}

pub fn get_sources(config: &Config) -> Vec<SourceStatus> {
    config
        .sources
        .iter()
        .map(|cfg| {
            let source = cfg.source().ok();
            let (kind, healthy, detail) = match cfg.kind {
                SourceKind::Manifest => match &cfg.manifest {
                    Some(path) if path.exists() => ("manifest", true, path.display().to_string()),
                    Some(path) => (
                        "manifest",
                        false,
                        format!("{} (missing)", path.display()),
                    ),
                    None => ("manifest", false, "no manifest path".to_string()),
                },
                SourceKind::HttpJson => match &cfg.endpoint {
                    Some(endpoint) => ("http_json", true, endpoint.clone()),
                    None => ("http_json", false, "no endpoint".to_string()),
                },
            };
            SourceStatus {
                name: cfg.name.clone(),
                source,
                kind,
                enabled: cfg.enabled,
                healthy: healthy && source.is_some(),
                detail,
            }
        })
        .collect()
}

pub fn list_sources(config: &Config) -> Result<()> {
    let sources = get_sources(config);

    println!(
        "{:<10} {:<5} {:<10} {:<8} {:<8} DETAIL",
        "SOURCE", "CODE", "KIND", "ENABLED", "HEALTHY"
    );
    for s in &sources {
        let code = s.source.map(|src| src.code().to_string()).unwrap_or_else(|| "?".into());
        println!(
            "{:<10} {:<5} {:<10} {:<8} {:<8} {}",
            s.name, code, s.kind, s.enabled, s.healthy, s.detail
        );
    }
    if sources.is_empty() {
        println!("(no sources configured)");
    }

    println!();
    println!(
        "circuit breaker: opens after {} failures, {}s cooldown, {} trial successes to close",
        config.circuit_breaker.failure_threshold,
        config.circuit_breaker.cooldown_secs,
        config.circuit_breaker.half_open_successes
    );
    println!(
        "url safety: {:?} mode, {} allowed hosts",
        config.safety.mode,
        config.safety.allowed_hosts.len()
    );
    for host in &config.safety.allowed_hosts {
        println!("  {}", host);
    }

    Ok(())
}

/// Run one URL through the outbound validator. Returns whether it passed.
pub async fn run_check_url(config: &Config, url: &str) -> Result<bool> {
    let validator = UrlValidator::new(&config.safety);
    let verdict = validator.validate(url).await;
    if verdict.allowed {
        println!("allowed: {}", url);
    } else {
        println!("denied: {} ({})", url, verdict.reason);
    }
    Ok(verdict.allowed)
}
