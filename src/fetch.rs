//! Image downloads.
//!
//! [`HttpFetcher`] owns no connection pool of its own: it wraps the one
//! shared `reqwest::Client` built by [`build_client`]. Automatic redirects
//! are disabled on that client; redirects are followed by hand so every hop
//! is re-checked by the [`UrlValidator`] before it is requested, and the
//! client resolves hosts through [`PublicOnlyResolver`] when it connects.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::redirect;
use tracing::debug;
use url::Url;

use crate::config::OrchestratorConfig;
use crate::error::FetchError;
use crate::url_guard::{PublicOnlyResolver, UrlValidator};

/// Downloads the raw bytes of one image.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError>;
}

/// The HTTP client shared by the fetcher and HTTP extractors.
pub fn build_client(cfg: &OrchestratorConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.fetch_timeout_secs))
        .connect_timeout(Duration::from_secs(cfg.fetch_timeout_secs.min(10)))
        .redirect(redirect::Policy::none())
        .dns_resolver(Arc::new(PublicOnlyResolver::system()))
        .user_agent(cfg.user_agent.clone())
        .build()?)
}

pub struct HttpFetcher {
    client: reqwest::Client,
    validator: Arc<UrlValidator>,
    max_redirects: usize,
    max_retries: u32,
    retry_base: Duration,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client, validator: Arc<UrlValidator>, cfg: &OrchestratorConfig) -> Self {
        Self {
            client,
            validator,
            max_redirects: cfg.max_redirects,
            max_retries: cfg.max_retries,
            retry_base: Duration::from_millis(cfg.retry_base_ms),
            max_bytes: cfg.max_image_bytes,
        }
    }

    async fn fetch_once(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let mut current = url.clone();

        for _hop in 0..=self.max_redirects {
            let verdict = self.validator.validate_url(&current).await;
            if !verdict.allowed {
                return Err(FetchError::Rejected(verdict.reason));
            }

            let mut response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| FetchError::Transient(e.to_string()))?;
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        FetchError::Permanent(format!("HTTP {} without Location", status.as_u16()))
                    })?;
                let next = current
                    .join(location)
                    .map_err(|e| FetchError::Permanent(format!("bad redirect target: {}", e)))?;
                debug!(from = %current, to = %next, "following redirect");
                current = next;
                continue;
            }

            if status.as_u16() == 429 || status.is_server_error() {
                return Err(FetchError::Transient(format!("HTTP {}", status.as_u16())));
            }
            if !status.is_success() {
                return Err(FetchError::Permanent(format!("HTTP {}", status.as_u16())));
            }

            if let Some(len) = response.content_length() {
                if len > self.max_bytes {
                    return Err(FetchError::TooLarge {
                        limit: self.max_bytes,
                    });
                }
            }

            let mut body = Vec::new();
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| FetchError::Transient(e.to_string()))?
            {
                if body.len() as u64 + chunk.len() as u64 > self.max_bytes {
                    return Err(FetchError::TooLarge {
                        limit: self.max_bytes,
                    });
                }
                body.extend_from_slice(&chunk);
            }
            if body.is_empty() {
                return Err(FetchError::Permanent("empty body".to_string()));
            }
            return Ok(body);
        }

        Err(FetchError::Permanent(format!(
            "more than {} redirects",
            self.max_redirects
        )))
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(self.retry_base, attempt)).await;
            }

            match self.fetch_once(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_transient() => {
                    debug!(%url, attempt, error = %e, "image fetch failed, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| FetchError::Transient("fetch failed after retries".into())))
    }
}

/// Exponential backoff: base, 2×base, 4×base, ... capped at 32×base.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * (1u32 << attempt.saturating_sub(1).min(5))
}
