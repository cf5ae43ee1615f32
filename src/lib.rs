//! # Listing Harvest
//!
//! A crash-safe harvester for real-estate listing photos.
//!
//! Listing Harvest asks a set of configured sources (Zillow, Redfin,
//! Realtor, MLS, county assessor) for the image URLs of each property,
//! downloads them through an SSRF-checked client, drops near-duplicates
//! with perceptual hashing, and stores the survivors under descriptive
//! file names. Progress is persisted atomically so an interrupted run can
//! resume where it stopped.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────┐   ┌───────────┐
//! │ Extractors  │──▶│ URL guard +  │──▶│ pHash/dHash│──▶│  Storage  │
//! │ per source  │   │ fetch        │   │ LSH dedup  │   │ + state   │
//! └─────────────┘   └──────────────┘   └────────────┘   └───────────┘
//!        ▲                                                    │
//!        └──────── circuit breakers ◀── orchestrator ─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest sources                        # check configured sources
//! harvest extract --address "123 Main St"
//! harvest extract --all --source zillow --dry-run
//! harvest state show                     # completed / failed addresses
//! harvest stats                          # what is on disk
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed errors per subsystem |
//! | [`url_guard`] | Outbound URL validation |
//! | [`phash`] | Perceptual and difference hashes |
//! | [`dedup`] | LSH-backed near-duplicate index |
//! | [`circuit`] | Per-source circuit breakers |
//! | [`naming`] | Artifact file names and classification |
//! | [`state`] | Crash-safe metadata files and backups |
//! | [`traits`] | Source extractor trait and registry |
//! | [`extractor_manifest`] | Extractor backed by a JSON listing file |
//! | [`extractor_http`] | Extractor backed by a JSON HTTP endpoint |
//! | [`fetch`] | Image download with redirects and retries |
//! | [`orchestrator`] | Concurrent extraction runs |
//! | [`progress`] | Progress reporting |

pub mod circuit;
pub mod config;
pub mod dedup;
pub mod error;
pub mod extract_cmd;
pub mod extractor_http;
pub mod extractor_manifest;
pub mod fetch;
pub mod models;
pub mod naming;
pub mod orchestrator;
pub mod phash;
pub mod progress;
pub mod sources;
pub mod state;
pub mod state_cmd;
pub mod stats;
pub mod traits;
pub mod url_guard;
