//! Manifest extractor: replays image URLs from a JSON file.
//!
//! The file maps addresses to either a bare URL list or an object with
//! `urls` and optional `fields`:
//!
//! ```json
//! {
//!   "123 Main St, Phoenix, AZ 85001": [
//!     "https://photos.zillowstatic.com/fp/a.jpg"
//!   ],
//!   "9 Elm Ave, Mesa, AZ 85201": {
//!     "urls": ["https://ssl.cdn-redfin.com/photo/b.jpg"],
//!     "fields": { "beds": 3, "baths": 2 }
//!   }
//! }
//! ```
//!
//! Addresses are matched after normalization (case and whitespace), so the
//! file can be exported from any listing tool. Useful for offline runs,
//! for sources that are scraped by other tooling, and in tests.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::error::SourceError;
use crate::models::{ImageSource, Property};
use crate::traits::SourceExtractor;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestEntry {
    Urls(Vec<String>),
    Detailed {
        urls: Vec<String>,
        #[serde(default)]
        fields: Option<Map<String, Value>>,
    },
}

#[derive(Debug, Clone)]
struct Listing {
    urls: Vec<String>,
    fields: Option<Map<String, Value>>,
}

pub struct ManifestExtractor {
    name: String,
    source: ImageSource,
    listings: HashMap<String, Listing>,
}

impl ManifestExtractor {
    pub fn from_path(source: ImageSource, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        Self::from_json(source, &content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))
    }

    pub fn from_json(source: ImageSource, json: &str) -> Result<Self> {
        let raw: HashMap<String, ManifestEntry> = serde_json::from_str(json)?;
        let listings = raw
            .into_iter()
            .map(|(address, entry)| {
                let listing = match entry {
                    ManifestEntry::Urls(urls) => Listing { urls, fields: None },
                    ManifestEntry::Detailed { urls, fields } => Listing { urls, fields },
                };
                (Property::new(address).normalized_address(), listing)
            })
            .collect();
        Ok(Self {
            name: format!("manifest:{}", source),
            source,
            listings,
        })
    }

    fn listing(&self, property: &Property) -> Option<&Listing> {
        self.listings.get(&property.normalized_address())
    }
}

#[async_trait]
impl SourceExtractor for ManifestExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> ImageSource {
        self.source
    }

    fn can_handle(&self, property: &Property) -> bool {
        self.listing(property).is_some()
    }

    async fn extract_image_urls(&self, property: &Property) -> Result<Vec<Url>, SourceError> {
        let listing = self
            .listing(property)
            .ok_or_else(|| SourceError::NotFound(property.address.clone()))?;

        let mut urls = Vec::with_capacity(listing.urls.len());
        for raw in &listing.urls {
            match Url::parse(raw) {
                Ok(url) => urls.push(url),
                Err(e) => debug!(source = %self.source, url = %raw, error = %e, "skipping unparseable url"),
            }
        }
        Ok(urls)
    }

    async fn extract_structured_fields(
        &self,
        property: &Property,
    ) -> Result<Option<Map<String, Value>>, SourceError> {
        Ok(self.listing(property).and_then(|l| l.fields.clone()))
    }
}
