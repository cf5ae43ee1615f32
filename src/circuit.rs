//! Per-source circuit breakers.
//!
//! ```text
//!            K consecutive failures
//!   CLOSED ─────────────────────────▶ OPEN ◀──────────────┐
//!     ▲                                 │ cooldown         │ any failure
//!     │ M consecutive successes         ▼                  │
//!     └──────────────────────────── HALF_OPEN ─────────────┘
//! ```
//!
//! While OPEN, calls are refused with [`SourceError::CircuitOpen`] without
//! touching the source. HALF_OPEN admits one trial call at a time. Only
//! transient failures (timeouts, rate limits, blocks) count; permanent ones
//! say nothing about source health and leave the breaker as it was.
//!
//! Breaker state lives in memory only. A fresh run re-learns source health
//! within a few calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::SourceError;
use crate::models::ImageSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub half_open_successes: u32,
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(cfg: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            cooldown: Duration::from_secs(cfg.cooldown_secs),
            half_open_successes: cfg.half_open_successes,
        }
    }
}

/// What a breaker learned from one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Transient failure; counts toward opening.
    Failure,
    /// Permanent failure; does not reflect source health.
    Neutral,
}

impl Outcome {
    pub fn of<T>(result: &Result<T, SourceError>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(e) if e.is_transient() => Outcome::Failure,
            Err(_) => Outcome::Neutral,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    half_open_successes: u32,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            half_open_successes: 0,
            trial_in_flight: false,
        }
    }

    /// Current state, promoting OPEN to HALF_OPEN once the cooldown is over.
    pub fn state_at(&mut self, now: Instant) -> CircuitState {
        if self.state == CircuitState::Open && self.cooldown_elapsed(now) {
            self.state = CircuitState::HalfOpen;
            self.half_open_successes = 0;
            self.trial_in_flight = false;
        }
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.last_failure
            .map(|t| now.saturating_duration_since(t) >= self.settings.cooldown)
            .unwrap_or(true)
    }

    /// Ask permission for one call. `false` means refuse without calling.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        match self.state_at(now) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_at(&mut self, outcome: Outcome, now: Instant) {
        match outcome {
            Outcome::Success => self.on_success(),
            Outcome::Failure => self.on_failure(now),
            Outcome::Neutral => self.trial_in_flight = false,
        }
    }

    fn on_success(&mut self) {
        self.trial_in_flight = false;
        match self.state {
            CircuitState::Closed => self.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.settings.half_open_successes {
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    self.half_open_successes = 0;
                }
            }
            // a call admitted before the breaker opened finished late
            CircuitState::Open => {}
        }
    }

    fn on_failure(&mut self, now: Instant) {
        self.trial_in_flight = false;
        self.last_failure = Some(now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= self.settings.failure_threshold {
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}

/// Health summary of one source's breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub source: ImageSource,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// One independent breaker per source.
pub struct CircuitBreakers {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<ImageSource, CircuitBreaker>>,
}

impl CircuitBreakers {
    pub fn new(settings: BreakerSettings, sources: &[ImageSource]) -> Self {
        let breakers = sources
            .iter()
            .map(|s| (*s, CircuitBreaker::new(settings)))
            .collect();
        Self {
            settings,
            breakers: Mutex::new(breakers),
        }
    }

    fn with<R>(&self, source: ImageSource, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut map = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let breaker = map
            .entry(source)
            .or_insert_with(|| CircuitBreaker::new(self.settings));
        f(breaker)
    }

    pub fn state(&self, source: ImageSource) -> CircuitState {
        self.with(source, |b| b.state_at(Instant::now()))
    }

    pub fn is_open(&self, source: ImageSource) -> bool {
        self.state(source) == CircuitState::Open
    }

    pub fn try_acquire(&self, source: ImageSource) -> Result<(), SourceError> {
        if self.with(source, |b| b.try_acquire_at(Instant::now())) {
            Ok(())
        } else {
            Err(SourceError::CircuitOpen(source))
        }
    }

    pub fn record(&self, source: ImageSource, outcome: Outcome) {
        let now = Instant::now();
        let (before, after) = self.with(source, |b| {
            let before = b.state_at(now);
            b.record_at(outcome, now);
            (before, b.state_at(now))
        });
        if before != after {
            match after {
                CircuitState::Open => warn!(%source, "circuit opened"),
                CircuitState::Closed => info!(%source, "circuit closed"),
                CircuitState::HalfOpen => {}
            }
        }
    }

    /// Run `f` under the breaker for `source`: refuse while open, otherwise
    /// call and record the classified outcome.
    pub async fn call<T, F, Fut>(&self, source: ImageSource, f: F) -> Result<T, SourceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        self.try_acquire(source)?;
        let result = f().await;
        self.record(source, Outcome::of(&result));
        result
    }

    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let now = Instant::now();
        let mut map = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out: Vec<BreakerStatus> = map
            .iter_mut()
            .map(|(source, b)| BreakerStatus {
                source: *source,
                state: b.state_at(now),
                consecutive_failures: b.consecutive_failures(),
            })
            .collect();
        out.sort_by_key(|s| s.source);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(cooldown_secs: u64) -> BreakerSettings {
        BreakerSettings::from(&CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown_secs,
            half_open_successes: 2,
        })
    }

    #[test]
    fn opens_after_threshold_and_recovers_after_cooldown() {
        let mut b = CircuitBreaker::new(settings(300));
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(b.try_acquire_at(t0));
            b.record_at(Outcome::Failure, t0);
        }
        assert_eq!(b.state_at(t0), CircuitState::Open);
        assert!(!b.try_acquire_at(t0 + Duration::from_secs(299)));

        let after = t0 + Duration::from_secs(300);
        assert_eq!(b.state_at(after), CircuitState::HalfOpen);

        // one trial at a time
        assert!(b.try_acquire_at(after));
        assert!(!b.try_acquire_at(after));
        b.record_at(Outcome::Success, after);
        assert_eq!(b.state_at(after), CircuitState::HalfOpen);

        assert!(b.try_acquire_at(after));
        b.record_at(Outcome::Success, after);
        assert_eq!(b.state_at(after), CircuitState::Closed);
        assert!(b.try_acquire_at(after));
        assert!(b.try_acquire_at(after));
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_cooldown() {
        let mut b = CircuitBreaker::new(settings(60));
        let t0 = Instant::now();
        for _ in 0..3 {
            b.record_at(Outcome::Failure, t0);
        }
        let t1 = t0 + Duration::from_secs(61);
        assert!(b.try_acquire_at(t1));
        b.record_at(Outcome::Success, t1);
        assert!(b.try_acquire_at(t1));
        b.record_at(Outcome::Failure, t1);
        assert_eq!(b.state_at(t1), CircuitState::Open);
        assert!(!b.try_acquire_at(t1 + Duration::from_secs(59)));
        assert_eq!(b.state_at(t1 + Duration::from_secs(60)), CircuitState::HalfOpen);
    }

    #[test]
    fn success_resets_consecutive_count() {
        let mut b = CircuitBreaker::new(settings(300));
        let t0 = Instant::now();
        b.record_at(Outcome::Failure, t0);
        b.record_at(Outcome::Failure, t0);
        b.record_at(Outcome::Success, t0);
        b.record_at(Outcome::Failure, t0);
        b.record_at(Outcome::Failure, t0);
        assert_eq!(b.state_at(t0), CircuitState::Closed);
        assert_eq!(b.consecutive_failures(), 2);
    }

    #[test]
    fn permanent_failures_do_not_count() {
        let mut b = CircuitBreaker::new(settings(300));
        let t0 = Instant::now();
        for _ in 0..10 {
            b.record_at(Outcome::Neutral, t0);
        }
        assert_eq!(b.state_at(t0), CircuitState::Closed);
        assert_eq!(
            Outcome::of::<()>(&Err(SourceError::NotFound("x".into()))),
            Outcome::Neutral
        );
        assert_eq!(Outcome::of::<()>(&Err(SourceError::Timeout)), Outcome::Failure);
        assert_eq!(Outcome::of::<()>(&Err(SourceError::Cancelled)), Outcome::Neutral);
    }

    #[tokio::test]
    async fn fourth_call_is_refused_without_invoking_extractor() {
        let breakers = CircuitBreakers::new(settings(300), &[ImageSource::Zillow]);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let r: Result<(), _> = breakers
                .call(ImageSource::Zillow, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SourceError::Timeout)
                })
                .await;
            assert_eq!(r, Err(SourceError::Timeout));
        }

        let r: Result<(), _> = breakers
            .call(ImageSource::Zillow, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(r, Err(SourceError::CircuitOpen(ImageSource::Zillow)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn breakers_are_independent_per_source() {
        let breakers = CircuitBreakers::new(
            settings(300),
            &[ImageSource::Zillow, ImageSource::Redfin],
        );
        for _ in 0..3 {
            breakers.record(ImageSource::Zillow, Outcome::Failure);
        }
        assert!(breakers.is_open(ImageSource::Zillow));
        assert!(!breakers.is_open(ImageSource::Redfin));
        let r = breakers
            .call(ImageSource::Redfin, || async { Ok::<_, SourceError>(7) })
            .await;
        assert_eq!(r, Ok(7));

        let statuses = breakers.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].source, ImageSource::Zillow);
        assert_eq!(statuses[0].state, CircuitState::Open);
    }

    #[tokio::test]
    async fn zero_cooldown_recovers_through_call() {
        let breakers = CircuitBreakers::new(settings(0), &[ImageSource::Mls]);
        for _ in 0..3 {
            breakers.record(ImageSource::Mls, Outcome::Failure);
        }
        for _ in 0..2 {
            let r = breakers
                .call(ImageSource::Mls, || async { Ok::<_, SourceError>(()) })
                .await;
            assert!(r.is_ok());
        }
        assert_eq!(breakers.state(ImageSource::Mls), CircuitState::Closed);
    }
}
