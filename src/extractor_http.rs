//! HTTP JSON extractor: asks a listing photo API for image URLs.
//!
//! The endpoint is a URL template with an `{address}` placeholder, which is
//! replaced by the URL-encoded address. The response body is either a JSON
//! array of URLs or an object `{ "urls": [...], "fields": {...} }`.
//!
//! Before each request the rendered endpoint is checked by the
//! [`UrlValidator`]; redirects are not followed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::error::SourceError;
use crate::models::{ImageSource, Property};
use crate::traits::SourceExtractor;
use crate::url_guard::UrlValidator;

pub const ADDRESS_PLACEHOLDER: &str = "{address}";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResponseBody {
    Urls(Vec<String>),
    Detailed {
        urls: Vec<String>,
        #[serde(default)]
        fields: Option<Map<String, Value>>,
    },
}

type Fields = Option<Map<String, Value>>;

pub struct HttpJsonExtractor {
    name: String,
    source: ImageSource,
    endpoint: String,
    client: reqwest::Client,
    validator: Arc<UrlValidator>,
    /// Fields seen in the last URL response, keyed by normalized address.
    fields: Mutex<HashMap<String, Fields>>,
}

impl HttpJsonExtractor {
    pub fn new(
        source: ImageSource,
        endpoint: String,
        client: reqwest::Client,
        validator: Arc<UrlValidator>,
    ) -> Result<Self> {
        if !endpoint.contains(ADDRESS_PLACEHOLDER) {
            bail!(
                "endpoint for source '{}' must contain {}",
                source,
                ADDRESS_PLACEHOLDER
            );
        }
        Ok(Self {
            name: format!("http:{}", source),
            source,
            endpoint,
            client,
            validator,
            fields: Mutex::new(HashMap::new()),
        })
    }

    /// The endpoint with the address filled in.
    pub fn endpoint_for(&self, property: &Property) -> String {
        let encoded: String =
            url::form_urlencoded::byte_serialize(property.address.trim().as_bytes()).collect();
        self.endpoint.replace(ADDRESS_PLACEHOLDER, &encoded)
    }

    async fn query(&self, property: &Property) -> Result<(Vec<Url>, Fields), SourceError> {
        let endpoint = self.endpoint_for(property);
        let verdict = self.validator.validate(&endpoint).await;
        if !verdict.allowed {
            return Err(SourceError::Malformed(format!(
                "endpoint rejected: {}",
                verdict.reason
            )));
        }

        let response = self
            .client
            .get(&endpoint)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response.headers(), &property.address));
        }

        let bytes = response.bytes().await.map_err(request_error)?;
        let (raw, fields) = match serde_json::from_slice::<ResponseBody>(&bytes) {
            Ok(ResponseBody::Urls(urls)) => (urls, None),
            Ok(ResponseBody::Detailed { urls, fields }) => (urls, fields),
            Err(e) => return Err(SourceError::Malformed(e.to_string())),
        };

        let urls = raw
            .iter()
            .filter_map(|u| match Url::parse(u) {
                Ok(url) => Some(url),
                Err(e) => {
                    debug!(source = %self.source, url = %u, error = %e, "skipping unparseable url");
                    None
                }
            })
            .collect();
        Ok((urls, fields))
    }
}

/// Map a non-success HTTP status to a classified source error.
pub(crate) fn status_error(status: StatusCode, headers: &HeaderMap, address: &str) -> SourceError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited {
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
            SourceError::Blocked(format!("HTTP {}", status.as_u16()))
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => SourceError::NotFound(address.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => SourceError::Timeout,
        s if s.is_server_error() => SourceError::Unavailable(format!("HTTP {}", s.as_u16())),
        s => SourceError::Malformed(format!("unexpected HTTP {}", s.as_u16())),
    }
}

fn request_error(e: reqwest::Error) -> SourceError {
    if e.is_timeout() {
        SourceError::Timeout
    } else if e.is_decode() {
        SourceError::Malformed(e.to_string())
    } else {
        SourceError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl SourceExtractor for HttpJsonExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> ImageSource {
        self.source
    }

    fn can_handle(&self, property: &Property) -> bool {
        !property.address.trim().is_empty()
    }

    async fn extract_image_urls(&self, property: &Property) -> Result<Vec<Url>, SourceError> {
        let (urls, fields) = self.query(property).await?;
        if let Ok(mut cache) = self.fields.lock() {
            cache.insert(property.normalized_address(), fields);
        }
        Ok(urls)
    }

    async fn extract_structured_fields(&self, property: &Property) -> Result<Fields, SourceError> {
        let cached = self
            .fields
            .lock()
            .ok()
            .and_then(|mut cache| cache.remove(&property.normalized_address()));
        match cached {
            Some(fields) => Ok(fields),
            None => Ok(self.query(property).await?.1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SafetyConfig;
    use reqwest::header::HeaderValue;

    fn extractor(endpoint: &str) -> HttpJsonExtractor {
        HttpJsonExtractor::new(
            ImageSource::Zillow,
            endpoint.to_string(),
            reqwest::Client::new(),
            Arc::new(UrlValidator::new(&SafetyConfig::default())),
        )
        .unwrap()
    }

    #[test]
    fn endpoint_requires_placeholder() {
        let result = HttpJsonExtractor::new(
            ImageSource::Zillow,
            "https://api.zillow.com/photos".into(),
            reqwest::Client::new(),
            Arc::new(UrlValidator::new(&SafetyConfig::default())),
        );
        assert!(result.is_err());
    }

    #[test]
    fn address_is_url_encoded() {
        let e = extractor("https://api.zillow.com/photos?address={address}");
        assert_eq!(
            e.endpoint_for(&Property::new(" 123 Main St, Phoenix & Co ")),
            "https://api.zillow.com/photos?address=123+Main+St%2C+Phoenix+%26+Co"
        );
    }

    #[test]
    fn status_mapping() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, &headers, "a"),
            SourceError::RateLimited { retry_after: None }
        );
        headers.insert(RETRY_AFTER, HeaderValue::from_static("42"));
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, &headers, "a"),
            SourceError::RateLimited {
                retry_after: Some(Duration::from_secs(42))
            }
        );
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, &headers, "a"),
            SourceError::Blocked(_)
        ));
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, &headers, "1 Main St"),
            SourceError::NotFound("1 Main St".into())
        );
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, &headers, "a"),
            SourceError::Unavailable(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, &headers, "a"),
            SourceError::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn rejected_endpoint_is_not_requested() {
        let e = extractor("http://169.254.169.254/latest?a={address}");
        let err = e
            .extract_image_urls(&Property::new("123 Main St"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Malformed(ref m) if m.starts_with("endpoint rejected")));
        assert!(!err.is_transient());
    }
}
