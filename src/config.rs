use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::models::ImageSource;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub properties: Option<PropertiesConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub metadata_dir: Option<PathBuf>,
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
}

impl StorageConfig {
    pub fn metadata_dir(&self) -> PathBuf {
        self.metadata_dir
            .clone()
            .unwrap_or_else(|| self.root.join("metadata"))
    }
}

fn default_backup_retention() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    #[default]
    Strict,
    Permissive,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SafetyConfig {
    #[serde(default)]
    pub mode: ValidationMode,
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            mode: ValidationMode::Strict,
            allowed_hosts: default_allowed_hosts(),
        }
    }
}

fn default_allowed_hosts() -> Vec<String> {
    [
        "zillow.com",
        "zillowstatic.com",
        "redfin.com",
        "cdn-redfin.com",
        "realtor.com",
        "rdcpix.com",
        "flexmls.com",
        "sparkplatform.com",
        "maricopa.gov",
    ]
    .iter()
    .map(|h| h.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,
    #[serde(default = "default_large_batch_threshold")]
    pub large_batch_threshold: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            download_concurrency: default_download_concurrency(),
            large_batch_threshold: default_large_batch_threshold(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_redirects: default_max_redirects(),
            max_image_bytes: default_max_image_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_concurrency() -> usize {
    3
}
fn default_download_concurrency() -> usize {
    10
}
fn default_large_batch_threshold() -> usize {
    100
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_max_redirects() -> usize {
    5
}
fn default_max_image_bytes() -> u64 {
    25 * 1024 * 1024
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36"
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            half_open_successes: default_half_open_successes(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_half_open_successes() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_phash_threshold")]
    pub phash_threshold: u32,
    #[serde(default = "default_dhash_threshold")]
    pub dhash_threshold: u32,
    #[serde(default = "default_lsh_bands")]
    pub lsh_bands: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            phash_threshold: default_phash_threshold(),
            dhash_threshold: default_dhash_threshold(),
            lsh_bands: default_lsh_bands(),
        }
    }
}

fn default_phash_threshold() -> u32 {
    8
}
fn default_dhash_threshold() -> u32 {
    10
}
fn default_lsh_bands() -> u32 {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct PropertiesConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Manifest,
    HttpJson,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn source(&self) -> Result<ImageSource> {
        self.name
            .parse::<ImageSource>()
            .map_err(|e| anyhow::anyhow!(e))
    }
}

impl Config {
    /// Config with defaults everywhere and no sources, rooted at `root`.
    pub fn minimal(root: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                root: root.into(),
                metadata_dir: None,
                backup_retention: default_backup_retention(),
            },
            safety: SafetyConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            dedup: DedupConfig::default(),
            properties: None,
            sources: Vec::new(),
        }
    }

    /// Enabled sources in configured order.
    pub fn enabled_sources(&self) -> Vec<ImageSource> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .filter_map(|s| s.source().ok())
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate storage
    if config.storage.backup_retention == 0 {
        anyhow::bail!("storage.backup_retention must be >= 1");
    }

    // Validate orchestrator
    if config.orchestrator.concurrency == 0 {
        anyhow::bail!("orchestrator.concurrency must be >= 1");
    }
    if config.orchestrator.download_concurrency == 0 {
        anyhow::bail!("orchestrator.download_concurrency must be >= 1");
    }
    if config.orchestrator.fetch_timeout_secs == 0 {
        anyhow::bail!("orchestrator.fetch_timeout_secs must be >= 1");
    }

    // Validate circuit breaker
    if config.circuit_breaker.failure_threshold == 0 {
        anyhow::bail!("circuit_breaker.failure_threshold must be >= 1");
    }
    if config.circuit_breaker.half_open_successes == 0 {
        anyhow::bail!("circuit_breaker.half_open_successes must be >= 1");
    }

    // Validate dedup
    if config.dedup.phash_threshold > 64 || config.dedup.dhash_threshold > 64 {
        anyhow::bail!("dedup thresholds must be in [0, 64]");
    }
    let bands = config.dedup.lsh_bands;
    if bands == 0 || bands > 64 || 64 % bands != 0 {
        anyhow::bail!(
            "dedup.lsh_bands must divide 64 (1, 2, 4, 8, 16, 32 or 64), got {}",
            bands
        );
    }

    // Validate sources
    let mut seen = BTreeSet::new();
    for src in &config.sources {
        let source = src.source()?;
        if !seen.insert(source) {
            anyhow::bail!("source '{}' is configured more than once", source);
        }
        match src.kind {
            SourceKind::Manifest if src.manifest.is_none() => {
                anyhow::bail!("source '{}' (manifest) requires a manifest path", src.name)
            }
            SourceKind::HttpJson => match &src.endpoint {
                None => anyhow::bail!("source '{}' (http_json) requires an endpoint", src.name),
                Some(ep) if !ep.contains("{address}") => anyhow::bail!(
                    "source '{}' endpoint must contain an {{address}} placeholder",
                    src.name
                ),
                Some(_) => {}
            },
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[storage]
root = "/tmp/harvest"
"#;

    #[test]
    fn defaults_apply() {
        let cfg: Config = toml::from_str(BASE).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.orchestrator.concurrency, 3);
        assert_eq!(cfg.orchestrator.large_batch_threshold, 100);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 3);
        assert_eq!(cfg.circuit_breaker.cooldown_secs, 300);
        assert_eq!(cfg.circuit_breaker.half_open_successes, 2);
        assert_eq!(cfg.dedup.phash_threshold, 8);
        assert_eq!(cfg.dedup.dhash_threshold, 10);
        assert_eq!(cfg.dedup.lsh_bands, 8);
        assert_eq!(cfg.storage.backup_retention, 10);
        assert_eq!(cfg.safety.mode, ValidationMode::Strict);
        assert_eq!(
            cfg.storage.metadata_dir(),
            PathBuf::from("/tmp/harvest/metadata")
        );
    }

    #[test]
    fn sources_keep_configured_order() {
        let text = format!(
            r#"{BASE}
[[sources]]
name = "redfin"
kind = "manifest"
manifest = "r.json"

[[sources]]
name = "zillow"
kind = "http_json"
endpoint = "https://api.zillow.com/photos?q={{address}}"

[[sources]]
name = "mls"
kind = "manifest"
manifest = "m.json"
enabled = false
"#
        );
        let cfg: Config = toml::from_str(&text).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(
            cfg.enabled_sources(),
            vec![ImageSource::Redfin, ImageSource::Zillow]
        );
    }

    #[test]
    fn rejects_band_count_not_dividing_64() {
        let text = format!("{BASE}\n[dedup]\nlsh_bands = 6\n");
        let cfg: Config = toml::from_str(&text).unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_unknown_and_duplicate_sources() {
        let unknown = format!(
            "{BASE}\n[[sources]]\nname = \"craigslist\"\nkind = \"manifest\"\nmanifest = \"c.json\"\n"
        );
        let cfg: Config = toml::from_str(&unknown).unwrap();
        assert!(validate(&cfg).is_err());

        let dup = format!(
            "{BASE}\n[[sources]]\nname = \"zillow\"\nkind = \"manifest\"\nmanifest = \"a.json\"\n\n[[sources]]\nname = \"zillow\"\nkind = \"manifest\"\nmanifest = \"b.json\"\n"
        );
        let cfg: Config = toml::from_str(&dup).unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn http_source_needs_address_placeholder() {
        let text = format!(
            "{BASE}\n[[sources]]\nname = \"redfin\"\nkind = \"http_json\"\nendpoint = \"https://redfin.com/api\"\n"
        );
        let cfg: Config = toml::from_str(&text).unwrap();
        assert!(validate(&cfg).is_err());
    }
}
