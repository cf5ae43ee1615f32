//! The source extractor seam.
//!
//! Every image source (listing portals, MLS feeds, assessor sites) is a
//! [`SourceExtractor`]: given a property, it returns the image URLs it knows
//! about. Extractors never download images themselves; fetching, hashing
//! and storage all happen in the orchestrator so every source gets the same
//! URL validation, dedup and naming.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           ExtractorRegistry              │
//! │  ┌──────────┐ ┌──────────┐ ┌───────────┐ │
//! │  │ Manifest │ │ HTTP     │ │  Custom   │ │
//! │  │ (replay) │ │ JSON     │ │  (Rust)   │ │
//! │  └──────────┘ └──────────┘ └───────────┘ │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        Orchestrator::extract_all()
//! ```
//!
//! # Usage
//!
//! ```rust
//! use listing_harvest::traits::ExtractorRegistry;
//!
//! let mut extractors = ExtractorRegistry::new();
//! // extractors.register(Box::new(MyExtractor::new()));
//! assert!(extractors.is_empty());
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use url::Url;

use crate::config::{Config, SourceKind};
use crate::error::SourceError;
use crate::models::{ImageSource, Property};
use crate::url_guard::UrlValidator;

// ═══════════════════════════════════════════════════════════════════════
// SourceExtractor Trait
// ═══════════════════════════════════════════════════════════════════════

/// An image source for listings.
///
/// # Lifecycle
///
/// 1. The extractor is registered via [`ExtractorRegistry::register`].
/// 2. For each property, the orchestrator asks
///    [`can_handle`](SourceExtractor::can_handle); if true and the source's
///    circuit breaker allows it, [`extract_image_urls`](SourceExtractor::extract_image_urls)
///    is called.
/// 3. Returned URLs are validated, downloaded, hashed and stored.
///
/// # Errors
///
/// Failures must be classified: [`SourceError::RateLimited`],
/// [`SourceError::Timeout`] and [`SourceError::Blocked`] are retried and
/// trip the circuit breaker; [`SourceError::NotFound`] and
/// [`SourceError::Malformed`] are not.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use listing_harvest::error::SourceError;
/// use listing_harvest::models::{ImageSource, Property};
/// use listing_harvest::traits::SourceExtractor;
/// use url::Url;
///
/// pub struct CountyAssessor;
///
/// #[async_trait]
/// impl SourceExtractor for CountyAssessor {
///     fn name(&self) -> &str { "county-assessor" }
///     fn source(&self) -> ImageSource { ImageSource::Assessor }
///
///     fn can_handle(&self, property: &Property) -> bool {
///         property.address.ends_with(", AZ")
///     }
///
///     async fn extract_image_urls(&self, _property: &Property) -> Result<Vec<Url>, SourceError> {
///         Ok(vec![])
///     }
/// }
/// ```
#[async_trait]
pub trait SourceExtractor: Send + Sync {
    /// Instance name shown in logs and `harvest sources`.
    fn name(&self) -> &str;

    /// The source this extractor's images are attributed to.
    fn source(&self) -> ImageSource;

    /// Whether this extractor can look the property up at all.
    fn can_handle(&self, property: &Property) -> bool;

    /// Discover image URLs for a property.
    async fn extract_image_urls(&self, property: &Property) -> Result<Vec<Url>, SourceError>;

    /// Optional non-image listing data (beds, baths, price, ...). Passed
    /// through to the caller unmodified.
    async fn extract_structured_fields(
        &self,
        _property: &Property,
    ) -> Result<Option<Map<String, Value>>, SourceError> {
        Ok(None)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Extractors in processing order.
///
/// Use [`ExtractorRegistry::from_config`] to build the configured
/// extractors, then optionally [`register`](ExtractorRegistry::register)
/// custom ones, which run after the configured ones.
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn SourceExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    /// Build every enabled `[[sources]]` entry, in array order.
    ///
    /// HTTP extractors share `client` and check their endpoint with
    /// `validator` before every request.
    pub fn from_config(
        config: &Config,
        client: reqwest::Client,
        validator: Arc<UrlValidator>,
    ) -> Result<Self> {
        use crate::extractor_http::HttpJsonExtractor;
        use crate::extractor_manifest::ManifestExtractor;

        let mut registry = Self::new();

        for cfg in config.sources.iter().filter(|s| s.enabled) {
            let source = cfg.source()?;
            match cfg.kind {
                SourceKind::Manifest => {
                    let path = cfg.manifest.as_ref().with_context(|| {
                        format!("source '{}' needs a manifest path", cfg.name)
                    })?;
                    registry.register(Box::new(ManifestExtractor::from_path(source, path)?));
                }
                SourceKind::HttpJson => {
                    let endpoint = cfg.endpoint.as_ref().with_context(|| {
                        format!("source '{}' needs an endpoint", cfg.name)
                    })?;
                    registry.register(Box::new(HttpJsonExtractor::new(
                        source,
                        endpoint.clone(),
                        client.clone(),
                        validator.clone(),
                    )?));
                }
            }
        }

        Ok(registry)
    }

    pub fn register(&mut self, extractor: Box<dyn SourceExtractor>) {
        self.extractors.push(extractor);
    }

    pub fn extractors(&self) -> &[Box<dyn SourceExtractor>] {
        &self.extractors
    }

    /// Find the extractor for a source.
    pub fn find(&self, source: ImageSource) -> Option<&dyn SourceExtractor> {
        self.extractors
            .iter()
            .find(|e| e.source() == source)
            .map(|e| e.as_ref())
    }

    /// Extractors whose source is in `filter`, in registry order. An empty
    /// filter selects all of them.
    pub fn selected(&self, filter: &[ImageSource]) -> Vec<&dyn SourceExtractor> {
        self.extractors
            .iter()
            .filter(|e| filter.is_empty() || filter.contains(&e.source()))
            .map(|e| e.as_ref())
            .collect()
    }

    pub fn sources(&self) -> Vec<ImageSource> {
        self.extractors.iter().map(|e| e.source()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(ImageSource);

    #[async_trait]
    impl SourceExtractor for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn source(&self) -> ImageSource {
            self.0
        }
        fn can_handle(&self, _property: &Property) -> bool {
            true
        }
        async fn extract_image_urls(&self, _property: &Property) -> Result<Vec<Url>, SourceError> {
            Ok(vec![])
        }
    }

    #[test]
    fn selected_keeps_registry_order() {
        let mut registry = ExtractorRegistry::new();
        registry.register(Box::new(Fixed(ImageSource::Redfin)));
        registry.register(Box::new(Fixed(ImageSource::Zillow)));
        registry.register(Box::new(Fixed(ImageSource::Mls)));

        let all: Vec<_> = registry.selected(&[]).iter().map(|e| e.source()).collect();
        assert_eq!(all, [ImageSource::Redfin, ImageSource::Zillow, ImageSource::Mls]);

        let some: Vec<_> = registry
            .selected(&[ImageSource::Mls, ImageSource::Redfin])
            .iter()
            .map(|e| e.source())
            .collect();
        assert_eq!(some, [ImageSource::Redfin, ImageSource::Mls]);

        assert!(registry.find(ImageSource::Zillow).is_some());
        assert!(registry.find(ImageSource::Assessor).is_none());
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn structured_fields_default_to_none() {
        let e = Fixed(ImageSource::Zillow);
        let fields = e
            .extract_structured_fields(&Property::new("123 Main St"))
            .await
            .unwrap();
        assert!(fields.is_none());
    }

    #[test]
    fn from_config_builds_enabled_sources_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let manifest = dir.path().join("m.json");
        std::fs::write(&manifest, "{}").unwrap();

        let mut config = Config::minimal(dir.path());
        config.sources = toml::from_str::<SourcesOnly>(&format!(
            r#"
            [[sources]]
            name = "realtor"
            kind = "manifest"
            manifest = "{m}"

            [[sources]]
            name = "zillow"
            kind = "http_json"
            endpoint = "https://api.zillow.com/photos?address={{address}}"

            [[sources]]
            name = "redfin"
            kind = "manifest"
            manifest = "{m}"
            enabled = false
            "#,
            m = manifest.display()
        ))
        .unwrap()
        .sources;

        let validator = Arc::new(UrlValidator::new(&config.safety));
        let registry =
            ExtractorRegistry::from_config(&config, reqwest::Client::new(), validator).unwrap();
        assert_eq!(registry.sources(), [ImageSource::Realtor, ImageSource::Zillow]);
    }

    #[derive(serde::Deserialize)]
    struct SourcesOnly {
        sources: Vec<crate::config::SourceConfig>,
    }
}
