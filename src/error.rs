//! Classified failures for the extraction pipeline.
//!
//! Every failure that can reach the orchestrator is a variant of one of the
//! enums below, so the decisions that depend on them (retry, feed the circuit
//! breaker, drop one image, abort the run) are exhaustive `match`es rather
//! than string sniffing.
//!
//! | Type | Raised by | Effect |
//! |------|-----------|--------|
//! | [`SourceError`] | source extractors, circuit breaker | source skipped; transient kinds counted by the breaker, all but blocks retried |
//! | [`FetchError`] | image downloads | image dropped |
//! | [`HashError`] | perceptual hashing | image dropped |
//! | [`StateError`] | state persistence | fall back to a backup, else abort |
//! | [`NameError`] | artifact file names | name rejected |

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::models::ImageSource;

/// Outcome of a failed source extractor call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("rate limited{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("request timed out")]
    Timeout,

    #[error("blocked by source: {0}")]
    Blocked(String),

    /// Connection failure or 5xx from the source.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("circuit open for source {0}")]
    CircuitOpen(ImageSource),

    /// The run was cancelled before the source answered.
    #[error("cancelled")]
    Cancelled,
}

impl SourceError {
    /// Transient failures are retried and count toward the circuit breaker.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::RateLimited { .. }
            | SourceError::Timeout
            | SourceError::Blocked(_)
            | SourceError::Unavailable(_) => true,
            SourceError::NotFound(_)
            | SourceError::Malformed(_)
            | SourceError::CircuitOpen(_)
            | SourceError::Cancelled => false,
        }
    }

    /// Worth asking again after a backoff. A block (401/403) counts against
    /// the breaker but is not retried: asking again only looks more like a bot.
    pub fn is_retryable(&self) -> bool {
        self.is_transient() && !matches!(self, SourceError::Blocked(_))
    }

    /// Short machine-friendly label used in logs and skip reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::RateLimited { .. } => "rate_limited",
            SourceError::Timeout => "timeout",
            SourceError::Blocked(_) => "blocked",
            SourceError::Unavailable(_) => "unavailable",
            SourceError::NotFound(_) => "not_found",
            SourceError::Malformed(_) => "malformed",
            SourceError::CircuitOpen(_) => "circuit_open",
            SourceError::Cancelled => "cancelled",
        }
    }
}

/// Failure to download a single image.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The URL (or a redirect target) failed network safety validation.
    #[error("url rejected: {0}")]
    Rejected(String),

    /// Timeout, connection failure, HTTP 429 or 5xx after all retries.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// Any other non-success response, or an unusable body.
    #[error("fetch failed: {0}")]
    Permanent(String),

    #[error("image exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is corrupt and no usable backup exists: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("malformed artifact name '{name}': {reason}")]
    Malformed { name: String, reason: String },

    #[error("unknown {field} '{value}'")]
    UnknownValue { field: &'static str, value: String },

    #[error("confidence {0} out of range 0..=100")]
    Confidence(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SourceError::Timeout.is_transient());
        assert!(SourceError::RateLimited { retry_after: None }.is_transient());
        assert!(SourceError::Blocked("captcha".into()).is_transient());
        assert!(SourceError::Unavailable("502".into()).is_transient());
        assert!(!SourceError::NotFound("listing".into()).is_transient());
        assert!(!SourceError::Malformed("json".into()).is_transient());
        assert!(!SourceError::CircuitOpen(ImageSource::Zillow).is_transient());
        assert!(!SourceError::Cancelled.is_transient());
    }

    #[test]
    fn blocks_count_but_are_not_retried() {
        assert!(SourceError::Timeout.is_retryable());
        assert!(SourceError::RateLimited { retry_after: None }.is_retryable());
        assert!(SourceError::Unavailable("503".into()).is_retryable());
        assert!(SourceError::Blocked("403".into()).is_transient());
        assert!(!SourceError::Blocked("403".into()).is_retryable());
        assert!(!SourceError::NotFound("listing".into()).is_retryable());
    }

    #[test]
    fn rate_limited_message_includes_retry_after() {
        let err = SourceError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.to_string(), "rate limited (retry after 30s)");
        assert_eq!(
            SourceError::RateLimited { retry_after: None }.to_string(),
            "rate limited"
        );
    }
}
