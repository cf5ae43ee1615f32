//! Near-duplicate index with locality-sensitive bucketing.
//!
//! The index keeps two structures that must always agree:
//!
//! - a flat map `image id → (pHash, dHash, metadata)`, which is what gets
//!   persisted, and
//! - LSH buckets: the 64-bit pHash is split into N equal-width bands and
//!   each `(band, band value)` maps to the ids sharing it.
//!
//! A lookup only compares against ids that share at least one band with the
//! candidate, so the cost is proportional to bucket sizes rather than the
//! number of indexed images. Buckets are derived data: they are rebuilt from
//! the flat map on load and never persisted.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::DedupConfig;
use crate::models::ImageSource;
use crate::phash::{hamming, PerceptualHash};

/// Metadata stored alongside each hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub property_hash: String,
    pub source: ImageSource,
    pub source_url: String,
}

/// Persisted form of one index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub phash: String,
    pub dhash: String,
    #[serde(flatten)]
    pub meta: IndexMeta,
}

/// Persisted form of the whole index: the flat map only.
pub type IndexSnapshot = BTreeMap<String, IndexEntry>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateMatch {
    pub id: String,
    pub phash_distance: u32,
    pub dhash_distance: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub entries: usize,
    pub buckets: usize,
    pub largest_bucket: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub phash: u32,
    pub dhash: u32,
}

impl From<&DedupConfig> for Thresholds {
    fn from(cfg: &DedupConfig) -> Self {
        Self {
            phash: cfg.phash_threshold,
            dhash: cfg.dhash_threshold,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    hash: PerceptualHash,
    meta: IndexMeta,
}

type BucketKey = (u32, u64);

#[derive(Debug, Clone)]
pub struct DedupIndex {
    bands: u32,
    thresholds: Thresholds,
    entries: HashMap<String, Entry>,
    buckets: HashMap<BucketKey, BTreeSet<String>>,
}

impl DedupIndex {
    /// `bands` is rounded down to a power of two in `1..=64` so every band
    /// has the same width.
    pub fn new(bands: u32, thresholds: Thresholds) -> Self {
        let bands = match bands.clamp(1, 64) {
            b if 64 % b == 0 => b,
            b => {
                let rounded = 1u32 << (31 - b.leading_zeros());
                warn!(requested = b, bands = rounded, "lsh band count must divide 64, rounding down");
                rounded
            }
        };
        Self {
            bands,
            thresholds,
            entries: HashMap::new(),
            buckets: HashMap::new(),
        }
    }

    pub fn bands(&self) -> u32 {
        self.bands
    }

    pub fn from_config(cfg: &DedupConfig) -> Self {
        Self::new(cfg.lsh_bands, Thresholds::from(cfg))
    }

    /// Rebuild an index, buckets included, from its persisted flat map.
    /// Entries with unparseable hashes are skipped and returned by id.
    pub fn from_snapshot(snapshot: IndexSnapshot, cfg: &DedupConfig) -> (Self, Vec<String>) {
        let mut index = Self::from_config(cfg);
        let mut skipped = Vec::new();
        for (id, entry) in snapshot {
            match PerceptualHash::from_hex(&entry.phash, &entry.dhash) {
                Some(hash) => index.register(&id, hash, entry.meta),
                None => skipped.push(id),
            }
        }
        (index, skipped)
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        self.entries
            .iter()
            .map(|(id, e)| {
                (
                    id.clone(),
                    IndexEntry {
                        phash: e.hash.phash_hex(),
                        dhash: e.hash.dhash_hex(),
                        meta: e.meta.clone(),
                    },
                )
            })
            .collect()
    }

    fn band_keys(&self, phash: u64) -> impl Iterator<Item = BucketKey> {
        let width = 64 / self.bands;
        let mask = if width == 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        };
        (0..self.bands).map(move |band| {
            let shift = 64 - width * (band + 1);
            (band, (phash >> shift) & mask)
        })
    }

    /// Find the closest indexed image within both thresholds, if any.
    pub fn is_duplicate(&self, candidate: &PerceptualHash) -> Option<DuplicateMatch> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for key in self.band_keys(candidate.phash) {
            if let Some(ids) = self.buckets.get(&key) {
                seen.extend(ids.iter().map(String::as_str));
            }
        }

        seen.into_iter()
            .filter_map(|id| {
                let entry = self.entries.get(id)?;
                let p = hamming(candidate.phash, entry.hash.phash);
                if p > self.thresholds.phash {
                    return None;
                }
                let d = hamming(candidate.dhash, entry.hash.dhash);
                if d > self.thresholds.dhash {
                    return None;
                }
                Some(DuplicateMatch {
                    id: id.to_string(),
                    phash_distance: p,
                    dhash_distance: d,
                })
            })
            .min_by(|a, b| {
                a.phash_distance
                    .cmp(&b.phash_distance)
                    .then_with(|| a.id.cmp(&b.id))
            })
    }

    /// Insert `id` into the flat map and all of its buckets. An existing
    /// registration for the same id is replaced.
    pub fn register(&mut self, id: &str, hash: PerceptualHash, meta: IndexMeta) {
        self.remove(id);
        let keys: Vec<BucketKey> = self.band_keys(hash.phash).collect();
        for key in keys {
            self.buckets.entry(key).or_default().insert(id.to_string());
        }
        self.entries.insert(id.to_string(), Entry { hash, meta });
    }

    /// Remove `id` from the flat map and every bucket. Returns whether it
    /// was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };
        let keys: Vec<BucketKey> = self.band_keys(entry.hash.phash).collect();
        for key in keys {
            if let Some(ids) = self.buckets.get_mut(&key) {
                ids.remove(id);
                if ids.is_empty() {
                    self.buckets.remove(&key);
                }
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.buckets.clear();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            entries: self.entries.len(),
            buckets: self.buckets.len(),
            largest_bucket: self.buckets.values().map(BTreeSet::len).max().unwrap_or(0),
        }
    }

    /// Every flat-map entry sits in exactly its N buckets and every bucket
    /// member has a flat-map entry.
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        for (id, entry) in &self.entries {
            for key in self.band_keys(entry.hash.phash) {
                if !self.buckets.get(&key).is_some_and(|ids| ids.contains(id)) {
                    return false;
                }
            }
        }
        self.buckets.iter().all(|(key, ids)| {
            !ids.is_empty()
                && ids.iter().all(|id| {
                    self.entries
                        .get(id)
                        .is_some_and(|e| self.band_keys(e.hash.phash).any(|k| k == *key))
                })
        })
    }
}
