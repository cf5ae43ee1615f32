//! Extraction pipeline orchestration.
//!
//! Coordinates the full flow for a batch of properties:
//!
//! ```text
//! property ─► extractor (per source, sequential) ─► URL validation
//!          ─► download (bounded parallel) ─► hash (blocking pool)
//!          ─► dedup check-and-insert ─► atomic write ─► manifest
//! ```
//!
//! Properties run on a worker pool gated by a semaphore. Within a property,
//! sources run one after another in configured order so a single listing
//! never bursts several requests at one site. Within a source, downloads
//! run with bounded parallelism.
//!
//! Failures are contained at the level they happen: a bad image is dropped,
//! a failing source is skipped (and fed to its circuit breaker), a property
//! with no successful source is marked failed. Nothing short of a broken
//! metadata directory stops the run.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::{stream, FutureExt, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::circuit::{BreakerSettings, CircuitBreakers};
use crate::config::{Config, OrchestratorConfig};
use crate::dedup::{DedupIndex, IndexMeta, IndexStats};
use crate::error::{FetchError, SourceError, StateError};
use crate::fetch::{backoff_delay, ImageFetcher};
use crate::models::{
    AddressFolders, ArtifactStatus, ExtractionState, ImageArtifact, ImageManifest, ImageSource,
    Property, RunRecord,
};
use crate::naming::{generate_name, ImageClassifier, KeywordClassifier, NameFields};
use crate::phash::{HashedImage, ImageHasher, PerceptualHasher};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::state::{write_atomic, StateManager};
use crate::traits::{ExtractorRegistry, SourceExtractor};
use crate::url_guard::UrlValidator;

/// Upper bound on a server-requested `Retry-After` wait.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Sources to query; empty means every configured source.
    pub sources: Vec<ImageSource>,
    /// Skip properties already marked completed.
    pub resume: bool,
    /// Discard the extraction state before starting.
    pub fresh: bool,
    /// Discover and validate URLs only; nothing is downloaded or persisted.
    pub dry_run: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            resume: true,
            fresh: false,
            dry_run: false,
        }
    }
}

/// An address with the reason it failed or was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyNote {
    pub address: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateHit {
    pub address: String,
    pub source_url: String,
    pub duplicate_of: String,
}

/// Everything one `extract_all` call did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionResult {
    pub run_id: String,
    pub dry_run: bool,
    pub cancelled: bool,
    pub completed: Vec<String>,
    pub failed: Vec<PropertyNote>,
    pub skipped: Vec<PropertyNote>,
    pub images_stored: usize,
    pub stored: Vec<ImageArtifact>,
    pub duplicates: Vec<DuplicateHit>,
    pub invalid_images: usize,
    pub fetch_failures: usize,
    pub rejected_urls: Vec<String>,
    pub sources_used: BTreeSet<ImageSource>,
    pub sources_blocked: BTreeSet<ImageSource>,
    /// Listing fields per address and source, exactly as extractors returned them.
    pub structured_fields: BTreeMap<String, BTreeMap<ImageSource, Map<String, Value>>>,
    /// Dry runs only: validated image URLs per address.
    pub discovered_urls: BTreeMap<String, Vec<String>>,
    /// Set to the stored count when it exceeded the large-batch threshold.
    pub large_batch_warning: Option<usize>,
}

impl ExtractionResult {
    /// No property failed and the run was not cancelled.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    pub fn duplicates_skipped(&self) -> usize {
        self.duplicates.len()
    }

    fn absorb(&mut self, report: PropertyReport) {
        let address = report.address;
        match report.outcome {
            PropertyOutcome::Completed => self.completed.push(address.clone()),
            PropertyOutcome::Failed(reason) => self.failed.push(PropertyNote {
                address: address.clone(),
                reason,
            }),
            PropertyOutcome::Skipped(reason) => self.skipped.push(PropertyNote {
                address: address.clone(),
                reason,
            }),
        }
        self.images_stored += report.stored.len();
        self.stored.extend(report.stored);
        self.duplicates.extend(report.duplicates);
        self.invalid_images += report.invalid_images;
        self.fetch_failures += report.fetch_failures;
        self.rejected_urls.extend(report.rejected_urls);
        self.sources_used.extend(report.sources_used);
        self.sources_blocked.extend(report.sources_blocked);
        if !report.structured_fields.is_empty() {
            self.structured_fields
                .insert(address.clone(), report.structured_fields);
        }
        if !report.discovered_urls.is_empty() {
            self.discovered_urls.insert(address, report.discovered_urls);
        }
    }

    fn to_run_record(&self, started_at: DateTime<Utc>, requested: usize) -> RunRecord {
        let mut notes = Vec::new();
        if let Some(count) = self.large_batch_warning {
            notes.push(format!("large batch: {} new images", count));
        }
        if !self.rejected_urls.is_empty() {
            notes.push(format!("{} urls rejected by safety checks", self.rejected_urls.len()));
        }
        RunRecord {
            run_id: self.run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            properties_requested: requested,
            properties_completed: self.completed.len(),
            properties_failed: self.failed.len(),
            properties_skipped: self.skipped.len(),
            images_extracted: self.images_stored,
            duplicates_skipped: self.duplicates.len(),
            sources_used: self.sources_used.iter().copied().collect(),
            sources_blocked: self.sources_blocked.iter().copied().collect(),
            dry_run: self.dry_run,
            cancelled: self.cancelled,
            notes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PropertyOutcome {
    Completed,
    Failed(String),
    Skipped(String),
}

impl PropertyOutcome {
    fn label(&self) -> &'static str {
        match self {
            PropertyOutcome::Completed => "completed",
            PropertyOutcome::Failed(_) => "failed",
            PropertyOutcome::Skipped(_) => "skipped",
        }
    }
}

/// What one worker did for one property.
struct PropertyReport {
    position: usize,
    address: String,
    outcome: PropertyOutcome,
    stored: Vec<ImageArtifact>,
    duplicates: Vec<DuplicateHit>,
    invalid_images: usize,
    fetch_failures: usize,
    rejected_urls: Vec<String>,
    sources_used: Vec<ImageSource>,
    sources_blocked: Vec<ImageSource>,
    structured_fields: BTreeMap<ImageSource, Map<String, Value>>,
    discovered_urls: Vec<String>,
}

impl PropertyReport {
    fn new(position: usize, address: &str, outcome: PropertyOutcome) -> Self {
        Self {
            position,
            address: address.to_string(),
            outcome,
            stored: Vec::new(),
            duplicates: Vec::new(),
            invalid_images: 0,
            fetch_failures: 0,
            rejected_urls: Vec::new(),
            sources_used: Vec::new(),
            sources_blocked: Vec::new(),
            structured_fields: BTreeMap::new(),
            discovered_urls: Vec::new(),
        }
    }
}

enum UrlOutcome {
    Stored(ImageArtifact),
    Duplicate(DuplicateHit),
    Rejected(String),
    FetchFailed,
    Invalid,
    WriteFailed,
}

/// A downloaded, hashed image on its way to disk.
struct Download {
    url: Url,
    bytes: Vec<u8>,
    hashed: HashedImage,
    downloaded_at: DateTime<Utc>,
}

struct RunContext {
    sources: Vec<ImageSource>,
    resume: bool,
    dry_run: bool,
    total: u64,
    finished: AtomicU64,
}

#[derive(Default)]
struct Catalog {
    manifest: ImageManifest,
    folders: AddressFolders,
}

/// Runs extractions. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    settings: OrchestratorConfig,
    storage_root: PathBuf,
    extractors: Arc<ExtractorRegistry>,
    validator: Arc<UrlValidator>,
    fetcher: Arc<dyn ImageFetcher>,
    hasher: Arc<dyn ImageHasher>,
    classifier: Arc<dyn ImageClassifier>,
    breakers: Arc<CircuitBreakers>,
    index: Arc<Mutex<DedupIndex>>,
    state: Arc<Mutex<ExtractionState>>,
    catalog: Arc<Mutex<Catalog>>,
    /// Serializes snapshot-and-write of the index and manifest files.
    persist: Arc<Mutex<()>>,
    store: Arc<StateManager>,
    progress: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Load persisted state through `store`. Images are downloaded with
    /// `fetcher`; hashing and classification use the defaults.
    pub fn new(
        config: &Config,
        extractors: ExtractorRegistry,
        store: StateManager,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Result<Self> {
        let state = store
            .load_state()
            .context("Failed to load extraction state")?;
        let snapshot = store.load_index().context("Failed to load hash index")?;
        let (index, dropped) = DedupIndex::from_snapshot(snapshot, &config.dedup);
        if !dropped.is_empty() {
            warn!(count = dropped.len(), "dropped index entries with unparseable hashes");
        }
        let catalog = Catalog {
            manifest: store.load_manifest().context("Failed to load image manifest")?,
            folders: store
                .load_address_folders()
                .context("Failed to load address folders")?,
        };
        let breakers = CircuitBreakers::new(
            BreakerSettings::from(&config.circuit_breaker),
            &extractors.sources(),
        );

        Ok(Self {
            settings: config.orchestrator.clone(),
            storage_root: config.storage.root.clone(),
            extractors: Arc::new(extractors),
            validator: Arc::new(UrlValidator::new(&config.safety)),
            fetcher,
            hasher: Arc::new(PerceptualHasher),
            classifier: Arc::new(KeywordClassifier),
            breakers: Arc::new(breakers),
            index: Arc::new(Mutex::new(index)),
            state: Arc::new(Mutex::new(state)),
            catalog: Arc::new(Mutex::new(catalog)),
            persist: Arc::new(Mutex::new(())),
            store: Arc::new(store),
            progress: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_validator(mut self, validator: Arc<UrlValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ImageHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ImageClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Cancelling this token lets running properties finish their current
    /// source and reports unstarted ones as skipped.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub async fn extraction_state(&self) -> ExtractionState {
        self.state.lock().await.clone()
    }

    pub async fn index_stats(&self) -> IndexStats {
        self.index.lock().await.stats()
    }

    pub async fn extract_all(
        &self,
        properties: Vec<Property>,
        opts: ExtractOptions,
    ) -> Result<ExtractionResult> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();

        for source in &opts.sources {
            if self.extractors.find(*source).is_none() {
                bail!("no extractor configured for source '{}'", source);
            }
        }

        let mut seen = HashSet::new();
        let properties: Vec<Property> = properties
            .into_iter()
            .map(|p| Property::new(p.address.trim()))
            .filter(|p| !p.address.is_empty() && seen.insert(p.normalized_address()))
            .collect();
        let requested = properties.len();

        if opts.fresh && !opts.dry_run {
            let mut state = self.state.lock().await;
            *state = ExtractionState::default();
            self.store
                .save_state(&state)
                .context("Failed to reset extraction state")?;
            info!("extraction state reset");
        }

        let run = Arc::new(RunContext {
            sources: opts.sources.clone(),
            resume: opts.resume && !opts.fresh,
            dry_run: opts.dry_run,
            total: requested as u64,
            finished: AtomicU64::new(0),
        });

        info!(%run_id, properties = requested, dry_run = opts.dry_run, "extraction started");
        self.progress
            .report(ProgressEvent::RunStarted { total: run.total });

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut workers = JoinSet::new();
        let mut reports = Vec::with_capacity(requested);

        for (position, property) in properties.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                reports.push(PropertyReport::new(
                    position,
                    &property.address,
                    PropertyOutcome::Skipped("cancelled".to_string()),
                ));
                continue;
            };

            let this = self.clone();
            let run = run.clone();
            workers.spawn(async move {
                let address = property.address.clone();
                let report = AssertUnwindSafe(this.process_property(position, property, run))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!(%address, "property worker panicked");
                        PropertyReport::new(
                            position,
                            &address,
                            PropertyOutcome::Failed("worker panicked".to_string()),
                        )
                    });
                drop(permit);
                report
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "property worker aborted"),
            }
        }
        reports.sort_by_key(|r| r.position);

        let mut result = ExtractionResult {
            run_id,
            dry_run: opts.dry_run,
            cancelled: self.cancel.is_cancelled(),
            ..Default::default()
        };
        for report in reports {
            result.absorb(report);
        }

        let threshold = self.settings.large_batch_threshold;
        if !opts.dry_run && result.images_stored > threshold {
            warn!(
                count = result.images_stored,
                threshold, "large batch of new images in one run, review the sources"
            );
            self.progress.report(ProgressEvent::LargeBatch {
                count: result.images_stored as u64,
                threshold: threshold as u64,
            });
            result.large_batch_warning = Some(result.images_stored);
        }

        if !opts.dry_run {
            let record = result.to_run_record(started_at, requested);
            if let Err(e) = self.store.append_run_record(&record) {
                warn!(error = %e, "failed to append run history");
            }
        }

        info!(
            run_id = %result.run_id,
            completed = result.completed.len(),
            failed = result.failed.len(),
            skipped = result.skipped.len(),
            stored = result.images_stored,
            duplicates = result.duplicates.len(),
            cancelled = result.cancelled,
            "extraction finished"
        );
        Ok(result)
    }

    async fn process_property(
        &self,
        position: usize,
        property: Property,
        run: Arc<RunContext>,
    ) -> PropertyReport {
        let address = property.address.clone();

        if run.resume && self.state.lock().await.is_completed(&address) {
            debug!(%address, "already completed, skipping");
            let report = PropertyReport::new(
                position,
                &address,
                PropertyOutcome::Skipped("already completed".to_string()),
            );
            return self.finish(report, &run);
        }

        let extractors: Vec<&dyn SourceExtractor> = self
            .extractors
            .selected(&run.sources)
            .into_iter()
            .filter(|e| e.can_handle(&property))
            .collect();
        if extractors.is_empty() {
            let report = PropertyReport::new(
                position,
                &address,
                PropertyOutcome::Skipped("no eligible sources".to_string()),
            );
            return self.finish(report, &run);
        }

        self.progress.report(ProgressEvent::PropertyStarted {
            address: address.clone(),
        });

        let mut report = PropertyReport::new(position, &address, PropertyOutcome::Completed);
        let folder_lock = Mutex::new(());
        let mut any_success = false;
        let mut interrupted = false;

        for extractor in extractors {
            if self.cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            let source = extractor.source();

            let result = self
                .breakers
                .call(source, || self.call_with_retries(extractor, &property))
                .await;

            let urls = match result {
                Ok(urls) => urls,
                Err(SourceError::Cancelled) => {
                    info!(%address, %source, "cancelled while waiting to retry source");
                    interrupted = true;
                    break;
                }
                Err(SourceError::CircuitOpen(_)) => {
                    info!(%address, %source, "circuit open, source unavailable");
                    report.sources_blocked.push(source);
                    self.progress.report(ProgressEvent::SourceSkipped {
                        address: address.clone(),
                        source,
                        reason: "source unavailable".to_string(),
                    });
                    continue;
                }
                Err(e) => {
                    warn!(%address, %source, kind = e.kind(), error = %e, "source failed");
                    if e.is_transient() {
                        report.sources_blocked.push(source);
                    }
                    self.progress.report(ProgressEvent::SourceSkipped {
                        address: address.clone(),
                        source,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            any_success = true;
            report.sources_used.push(source);
            self.progress.report(ProgressEvent::ImagesDiscovered {
                address: address.clone(),
                source,
                count: urls.len() as u64,
            });

            match extractor.extract_structured_fields(&property).await {
                Ok(Some(fields)) => {
                    report.structured_fields.insert(source, fields);
                }
                Ok(None) => {}
                Err(e) => debug!(%address, %source, error = %e, "structured fields unavailable"),
            }

            if run.dry_run {
                for url in urls {
                    if self.validator.validate_url(&url).await.allowed {
                        report.discovered_urls.push(url.to_string());
                    } else {
                        report.rejected_urls.push(url.to_string());
                    }
                }
                continue;
            }

            self.harvest(&property, source, urls, &folder_lock, &mut report)
                .await;
        }

        report.outcome = if interrupted {
            PropertyOutcome::Skipped("cancelled".to_string())
        } else if any_success {
            PropertyOutcome::Completed
        } else {
            PropertyOutcome::Failed("no source succeeded".to_string())
        };

        if !run.dry_run {
            if let Err(e) = self.persist(&address, &report).await {
                error!(%address, error = %e, "failed to persist state");
                report.outcome = PropertyOutcome::Failed(format!("state not persisted: {}", e));
            }
        }

        self.finish(report, &run)
    }

    fn finish(&self, report: PropertyReport, run: &RunContext) -> PropertyReport {
        let n = run.finished.fetch_add(1, Ordering::SeqCst) + 1;
        self.progress.report(ProgressEvent::PropertyFinished {
            address: report.address.clone(),
            outcome: report.outcome.label(),
            stored: report.stored.len() as u64,
            duplicates: report.duplicates.len() as u64,
            n,
            total: run.total,
        });
        report
    }

    /// Call the extractor, retrying transient failures with exponential
    /// backoff. The breaker sees only the final result. Cancellation during
    /// a backoff yields [`SourceError::Cancelled`], which the breaker ignores.
    async fn call_with_retries(
        &self,
        extractor: &dyn SourceExtractor,
        property: &Property,
    ) -> Result<Vec<Url>, SourceError> {
        let base = Duration::from_millis(self.settings.retry_base_ms);
        let mut attempt = 0;
        loop {
            match extractor.extract_image_urls(property).await {
                Ok(urls) => return Ok(urls),
                Err(e) if e.is_retryable() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    let mut delay = backoff_delay(base, attempt);
                    if let SourceError::RateLimited {
                        retry_after: Some(after),
                    } = &e
                    {
                        delay = delay.max(*after).min(MAX_RETRY_AFTER);
                    }
                    debug!(
                        address = %property.address,
                        source = %extractor.source(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying source"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(SourceError::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn harvest(
        &self,
        property: &Property,
        source: ImageSource,
        urls: Vec<Url>,
        folder_lock: &Mutex<()>,
        report: &mut PropertyReport,
    ) {
        let hash8 = property.short_hash();
        let folder = self.storage_root.join(&hash8);
        if let Err(e) = std::fs::create_dir_all(&folder) {
            error!(address = %property.address, folder = %folder.display(), error = %e, "cannot create property folder");
            report.fetch_failures += urls.len();
            return;
        }

        let outcomes: Vec<UrlOutcome> = stream::iter(urls)
            .map(|url| self.harvest_one(property, source, url, &folder, folder_lock))
            .buffer_unordered(self.settings.download_concurrency.max(1))
            .collect()
            .await;

        let mut stored = Vec::new();
        for outcome in outcomes {
            match outcome {
                UrlOutcome::Stored(artifact) => stored.push(artifact),
                UrlOutcome::Duplicate(hit) => report.duplicates.push(hit),
                UrlOutcome::Rejected(url) => report.rejected_urls.push(url),
                UrlOutcome::FetchFailed | UrlOutcome::WriteFailed => report.fetch_failures += 1,
                UrlOutcome::Invalid => report.invalid_images += 1,
            }
        }

        if !stored.is_empty() {
            let mut catalog = self.catalog.lock().await;
            catalog
                .folders
                .insert(property.address.clone(), hash8.clone());
            catalog
                .manifest
                .entry(hash8)
                .or_default()
                .extend(stored.iter().cloned());
        }
        report.stored.extend(stored);
    }

    async fn harvest_one(
        &self,
        property: &Property,
        source: ImageSource,
        url: Url,
        folder: &Path,
        folder_lock: &Mutex<()>,
    ) -> UrlOutcome {
        let address = &property.address;

        if !self.validator.validate_url(&url).await.allowed {
            return UrlOutcome::Rejected(url.to_string());
        }

        let bytes = match self.fetcher.fetch(&url).await {
            Ok(bytes) => bytes,
            Err(FetchError::Rejected(_)) => return UrlOutcome::Rejected(url.to_string()),
            Err(e) => {
                warn!(%address, %source, %url, error = %e, "image download failed");
                return UrlOutcome::FetchFailed;
            }
        };
        let downloaded_at = Utc::now();

        let hasher = self.hasher.clone();
        let hashed = tokio::task::spawn_blocking(move || {
            let hashed = hasher.hash(&bytes);
            (hashed, bytes)
        })
        .await;
        let (hashed, bytes) = match hashed {
            Ok((Ok(hashed), bytes)) => (hashed, bytes),
            Ok((Err(e), _)) => {
                debug!(%address, %url, error = %e, "dropping invalid image");
                return UrlOutcome::Invalid;
            }
            Err(e) => {
                error!(%address, %url, error = %e, "hashing task failed");
                return UrlOutcome::Invalid;
            }
        };

        let id = Uuid::new_v4().to_string();
        {
            let mut index = self.index.lock().await;
            if let Some(found) = index.is_duplicate(&hashed.hash) {
                debug!(
                    %address,
                    %url,
                    duplicate_of = %found.id,
                    phash_distance = found.phash_distance,
                    "duplicate image"
                );
                return UrlOutcome::Duplicate(DuplicateHit {
                    address: address.clone(),
                    source_url: url.to_string(),
                    duplicate_of: found.id,
                });
            }
            index.register(
                &id,
                hashed.hash,
                IndexMeta {
                    property_hash: property.short_hash(),
                    source,
                    source_url: url.to_string(),
                },
            );
        }

        let download = Download {
            url,
            bytes,
            hashed,
            downloaded_at,
        };
        match self
            .store_image(property, source, &id, &download, folder, folder_lock)
            .await
        {
            Ok(artifact) => UrlOutcome::Stored(artifact),
            Err(e) => {
                self.index.lock().await.remove(&id);
                error!(%address, url = %download.url, error = %e, "failed to store image, index entry rolled back");
                UrlOutcome::WriteFailed
            }
        }
    }

    async fn store_image(
        &self,
        property: &Property,
        source: ImageSource,
        id: &str,
        download: &Download,
        folder: &Path,
        folder_lock: &Mutex<()>,
    ) -> Result<ImageArtifact> {
        let class = self.classifier.classify(&download.url, &download.bytes);
        let fields = NameFields {
            property_hash: property.short_hash(),
            location: class.location,
            subject: class.subject,
            confidence: class.confidence.min(100),
            source,
            date: download.downloaded_at.date_naive(),
            sequence: None,
            extension: download.hashed.extension.to_string(),
        };

        let local_path = {
            let _guard = folder_lock.lock().await;
            let named = generate_name(folder, &fields)?;
            let path = folder.join(named.to_name());
            write_atomic(&path, &download.bytes)?;
            path
        };

        let mut artifact = ImageArtifact {
            id: id.to_string(),
            property_hash: fields.property_hash,
            address: property.address.clone(),
            source,
            source_url: download.url.to_string(),
            local_path,
            phash: download.hashed.hash.phash_hex(),
            dhash: download.hashed.hash.dhash_hex(),
            width: download.hashed.width,
            height: download.hashed.height,
            size_bytes: download.bytes.len() as u64,
            status: ArtifactStatus::Downloaded,
            downloaded_at: download.downloaded_at,
            processed_at: None,
            duplicate_of: None,
        };
        artifact
            .advance(ArtifactStatus::Processed)
            .map_err(anyhow::Error::msg)?;
        artifact
            .advance(ArtifactStatus::Stored)
            .map_err(anyhow::Error::msg)?;
        Ok(artifact)
    }

    /// Save index and manifest (if anything was stored), then mark the
    /// property in the extraction state and save it.
    async fn persist(&self, address: &str, report: &PropertyReport) -> Result<(), StateError> {
        if !report.stored.is_empty() {
            let _guard = self.persist.lock().await;
            let snapshot = self.index.lock().await.snapshot();
            self.store.save_index(&snapshot)?;
            let catalog = self.catalog.lock().await;
            self.store.save_manifest(&catalog.manifest)?;
            self.store.save_address_folders(&catalog.folders)?;
        }

        let mut state = self.state.lock().await;
        match &report.outcome {
            PropertyOutcome::Completed => state.mark_completed(address),
            PropertyOutcome::Failed(_) => state.mark_failed(address),
            PropertyOutcome::Skipped(_) => return Ok(()),
        }
        self.store.save_state(&state)
    }
}
