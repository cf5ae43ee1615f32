//! Storage statistics and health overview.
//!
//! Provides a quick summary of what's been harvested: images and bytes per
//! property folder, dedup index size, extraction progress and the last run.
//! Used by `harvest stats` to give confidence that extractions are working
//! as expected.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::config::Config;
use crate::dedup::{DedupIndex, IndexStats};
use crate::models::RunRecord;
use crate::naming::parse_name;
use crate::state::StateManager;

/// Per-property-folder breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderStats {
    pub folder: String,
    pub address: Option<String>,
    pub images: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub folders: Vec<FolderStats>,
    pub total_images: u64,
    pub total_bytes: u64,
    /// Files under the storage root that are not artifact names.
    pub unrecognized_files: u64,
    pub index: IndexStats,
    pub manifest_artifacts: usize,
    pub completed: usize,
    pub failed: usize,
    pub backups: usize,
    pub last_run: Option<RunRecord>,
}

/// Walk the storage root and read the metadata files.
pub fn collect_stats(config: &Config) -> Result<StorageStats> {
    let store = StateManager::new(config.storage.metadata_dir(), config.storage.backup_retention)?;
    let folders_by_hash: BTreeMap<String, String> = store
        .load_address_folders()?
        .into_iter()
        .map(|(address, hash)| (hash, address))
        .collect();

    let mut stats = StorageStats::default();
    let mut by_folder: BTreeMap<String, FolderStats> = BTreeMap::new();
    let root = &config.storage.root;
    let metadata_dir = config.storage.metadata_dir();

    if root.exists() {
        let walker = WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| e.path() != metadata_dir);
        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let folder = folder_of(root, entry.path());
            match (parse_name(&name), folder) {
                (Ok(fields), Some(folder)) if fields.property_hash == folder => {
                    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    let f = by_folder.entry(folder.clone()).or_insert_with(|| FolderStats {
                        address: folders_by_hash.get(&folder).cloned(),
                        folder,
                        ..Default::default()
                    });
                    f.images += 1;
                    f.bytes += size;
                    stats.total_images += 1;
                    stats.total_bytes += size;
                }
                _ => stats.unrecognized_files += 1,
            }
        }
    }
    stats.folders = by_folder.into_values().collect();

    let (index, _) = DedupIndex::from_snapshot(store.load_index()?, &config.dedup);
    stats.index = index.stats();
    stats.manifest_artifacts = store.load_manifest()?.values().map(Vec::len).sum();
    let state = store.load_state()?;
    stats.completed = state.completed.len();
    stats.failed = state.failed.len();
    stats.backups = store.list_backups()?.len();
    stats.last_run = store.run_history()?.pop();

    Ok(stats)
}

/// First path component below `root`, if the file sits in a folder.
fn folder_of(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let first = components.next()?;
    components.next()?;
    Some(first.as_os_str().to_string_lossy().to_string())
}

/// Run the stats command: collect and print a summary.
pub fn run_stats(config: &Config) -> Result<()> {
    let stats = collect_stats(config)?;

    println!("Listing Harvest: Storage Stats");
    println!("===============================");
    println!();
    println!("  Storage:     {}", config.storage.root.display());
    println!("  Images:      {}", stats.total_images);
    println!("  Size:        {}", format_bytes(stats.total_bytes));
    if stats.unrecognized_files > 0 {
        println!("  Other files: {}", stats.unrecognized_files);
    }
    println!();
    println!(
        "  Index:       {} hashes in {} buckets (largest {})",
        stats.index.entries, stats.index.buckets, stats.index.largest_bucket
    );
    println!("  Manifest:    {} artifacts", stats.manifest_artifacts);
    println!(
        "  Properties:  {} completed, {} failed",
        stats.completed, stats.failed
    );
    println!("  Backups:     {}", stats.backups);

    if let Some(run) = &stats.last_run {
        println!();
        println!(
            "  Last run:    {} ({})",
            run.finished_at.format("%Y-%m-%d %H:%M"),
            if run.dry_run { "dry-run" } else { "extract" }
        );
        println!(
            "               {} completed, {} failed, {} skipped, {} images, {} duplicates",
            run.properties_completed,
            run.properties_failed,
            run.properties_skipped,
            run.images_extracted,
            run.duplicates_skipped
        );
    }

    if !stats.folders.is_empty() {
        println!();
        println!("  By property:");
        println!("  {:<10} {:>7} {:>10}   {}", "FOLDER", "IMAGES", "SIZE", "ADDRESS");
        println!("  {}", "-".repeat(72));
        for f in &stats.folders {
            println!(
                "  {:<10} {:>7} {:>10}   {}",
                f.folder,
                f.images,
                format_bytes(f.bytes),
                f.address.as_deref().unwrap_or("?")
            );
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
pub(crate) fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AddressFolders;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn counts_artifacts_per_folder() {
        let dir = TempDir::new().unwrap();
        let config = Config::minimal(dir.path().join("data"));
        let root = &config.storage.root;
        fs::create_dir_all(root.join("3f9a12cc")).unwrap();
        fs::write(root.join("3f9a12cc/3f9a12cc_interior_kitchen_60_z_20261018.jpg"), [0u8; 100]).unwrap();
        fs::write(root.join("3f9a12cc/3f9a12cc_feature_unknown_00_r_20261018.png"), [0u8; 50]).unwrap();
        fs::write(root.join("3f9a12cc/notes.txt"), b"x").unwrap();
        fs::write(root.join("stray.jpg"), b"x").unwrap();

        let store = StateManager::new(config.storage.metadata_dir(), 10).unwrap();
        let mut folders = AddressFolders::new();
        folders.insert("123 Main St".into(), "3f9a12cc".into());
        store.save_address_folders(&folders).unwrap();

        let stats = collect_stats(&config).unwrap();
        assert_eq!(stats.total_images, 2);
        assert_eq!(stats.total_bytes, 150);
        assert_eq!(stats.unrecognized_files, 2);
        assert_eq!(
            stats.folders,
            vec![FolderStats {
                folder: "3f9a12cc".into(),
                address: Some("123 Main St".into()),
                images: 2,
                bytes: 150,
            }]
        );
        assert!(stats.last_run.is_none());
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
