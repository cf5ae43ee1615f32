//! Core data models used throughout the harvester.
//!
//! These types represent the properties, image artifacts, extraction progress
//! and run history that flow through the extraction pipeline and are
//! persisted by [`crate::state`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A listing, identified by its canonical full address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Property {
    pub address: String,
}

impl Property {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Address with surrounding whitespace trimmed, lowercased, and internal
    /// runs of whitespace collapsed to one space.
    pub fn normalized_address(&self) -> String {
        self.address
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    /// Stable 8-hex-digit hash of the normalized address. Names the
    /// property's artifact folder and prefixes every artifact file name.
    pub fn short_hash(&self) -> String {
        let digest = Sha256::digest(self.normalized_address().as_bytes());
        hex::encode(&digest[..4])
    }
}

/// Fixed set of origins an image can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Zillow,
    Redfin,
    Realtor,
    Mls,
    Assessor,
}

impl ImageSource {
    pub const ALL: [ImageSource; 5] = [
        ImageSource::Zillow,
        ImageSource::Redfin,
        ImageSource::Realtor,
        ImageSource::Mls,
        ImageSource::Assessor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSource::Zillow => "zillow",
            ImageSource::Redfin => "redfin",
            ImageSource::Realtor => "realtor",
            ImageSource::Mls => "mls",
            ImageSource::Assessor => "assessor",
        }
    }

    /// One-letter code embedded in artifact file names.
    pub fn code(&self) -> char {
        match self {
            ImageSource::Zillow => 'z',
            ImageSource::Redfin => 'r',
            ImageSource::Realtor => 't',
            ImageSource::Mls => 'm',
            ImageSource::Assessor => 'a',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|src| src.as_str() == lower)
            .ok_or_else(|| {
                format!(
                    "unknown source '{}'. Must be one of: zillow, redfin, realtor, mls, assessor",
                    s
                )
            })
    }
}

/// Lifecycle of a stored image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Downloaded,
    Processed,
    Stored,
    Failed,
}

impl ArtifactStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, ArtifactStatus::Stored | ArtifactStatus::Failed)
    }
}

/// One stored image.
///
/// Apart from [`advance`](ImageArtifact::advance) an artifact is never
/// mutated after creation. `duplicate_of` holds a plain identifier of the
/// canonical artifact, never a reference to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageArtifact {
    pub id: String,
    pub property_hash: String,
    pub address: String,
    pub source: ImageSource,
    pub source_url: String,
    pub local_path: PathBuf,
    pub phash: String,
    pub dhash: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
    pub status: ArtifactStatus,
    pub downloaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
}

impl ImageArtifact {
    /// Move the artifact forward in its lifecycle.
    ///
    /// Any non-terminal status may move to `Failed`; otherwise only forward
    /// moves along downloaded → processed → stored are accepted.
    pub fn advance(&mut self, next: ArtifactStatus) -> Result<(), String> {
        if self.status.is_terminal() {
            return Err(format!(
                "artifact {} is already {:?}",
                self.id, self.status
            ));
        }
        if next != ArtifactStatus::Failed && next <= self.status {
            return Err(format!(
                "cannot move artifact {} from {:?} to {:?}",
                self.id, self.status, next
            ));
        }
        if next == ArtifactStatus::Processed {
            self.processed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }
}

/// Which properties have been processed, and when each was last checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionState {
    #[serde(default)]
    pub completed: BTreeSet<String>,
    #[serde(default)]
    pub failed: BTreeSet<String>,
    #[serde(default)]
    pub last_checked: BTreeMap<String, DateTime<Utc>>,
}

impl ExtractionState {
    pub fn is_completed(&self, address: &str) -> bool {
        self.completed.contains(address)
    }

    pub fn mark_completed(&mut self, address: &str) {
        self.failed.remove(address);
        self.completed.insert(address.to_string());
        self.last_checked.insert(address.to_string(), Utc::now());
    }

    pub fn mark_failed(&mut self, address: &str) {
        self.completed.remove(address);
        self.failed.insert(address.to_string());
        self.last_checked.insert(address.to_string(), Utc::now());
    }
}

/// Immutable summary of one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub properties_requested: usize,
    pub properties_completed: usize,
    pub properties_failed: usize,
    pub properties_skipped: usize,
    pub images_extracted: usize,
    pub duplicates_skipped: usize,
    pub sources_used: Vec<ImageSource>,
    pub sources_blocked: Vec<ImageSource>,
    pub dry_run: bool,
    pub cancelled: bool,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Stored artifacts per property short hash.
pub type ImageManifest = BTreeMap<String, Vec<ImageArtifact>>;

/// Address → property short hash (artifact folder name).
pub type AddressFolders = BTreeMap<String, String>;
