//! `harvest state ...` and `harvest index ...`: inspect and repair the
//! metadata directory.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::config::Config;
use crate::dedup::{DedupIndex, IndexSnapshot};
use crate::models::ImageSource;
use crate::state::StateManager;
use crate::stats::format_bytes;

fn open_store(config: &Config) -> Result<StateManager> {
    Ok(StateManager::new(
        config.storage.metadata_dir(),
        config.storage.backup_retention,
    )?)
}

pub fn run_state_show(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let state = store.load_state()?;

    println!("metadata: {}", store.dir().display());
    println!("completed: {}", state.completed.len());
    for address in &state.completed {
        let checked = state
            .last_checked
            .get(address)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  {}  ({})", address, checked);
    }
    println!("failed: {}", state.failed.len());
    for address in &state.failed {
        println!("  {}", address);
    }

    let backups = store.list_backups()?;
    println!("backups: {}", backups.len());
    for b in &backups {
        println!("  {}  {}", b.name, format_bytes(b.size_bytes));
    }
    Ok(())
}

pub fn run_state_backup(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    match store.create_backup()? {
        Some(path) => println!("backup written: {}", path.display()),
        None => println!("no state file to back up"),
    }
    Ok(())
}

pub fn run_state_restore(config: &Config, name: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    let state = store.restore_from_backup(name)?;
    println!(
        "state restored: {} completed, {} failed",
        state.completed.len(),
        state.failed.len()
    );
    println!("previous state kept as a pre-restore backup");
    Ok(())
}

pub fn run_state_history(config: &Config, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let history = store.run_history()?;
    if history.is_empty() {
        println!("no runs recorded");
        return Ok(());
    }

    println!(
        "{:<17} {:<8} {:>5} {:>5} {:>5} {:>7} {:>5}   RUN",
        "FINISHED", "MODE", "DONE", "FAIL", "SKIP", "IMAGES", "DUPS"
    );
    for run in history.iter().rev().take(limit) {
        let mode = if run.dry_run {
            "dry-run"
        } else if run.cancelled {
            "cancel"
        } else {
            "extract"
        };
        println!(
            "{:<17} {:<8} {:>5} {:>5} {:>5} {:>7} {:>5}   {}",
            run.finished_at.format("%Y-%m-%d %H:%M"),
            mode,
            run.properties_completed,
            run.properties_failed,
            run.properties_skipped,
            run.images_extracted,
            run.duplicates_skipped,
            run.run_id
        );
    }
    Ok(())
}

pub fn run_index_stats(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let snapshot = store.load_index()?;

    let mut by_source: BTreeMap<ImageSource, usize> = BTreeMap::new();
    for entry in snapshot.values() {
        *by_source.entry(entry.meta.source).or_default() += 1;
    }

    let (index, dropped) = DedupIndex::from_snapshot(snapshot, &config.dedup);
    let stats = index.stats();
    println!("hashes: {}", stats.entries);
    println!(
        "lsh: {} bands, {} buckets, largest bucket {}",
        config.dedup.lsh_bands, stats.buckets, stats.largest_bucket
    );
    println!(
        "thresholds: phash <= {}, dhash <= {}",
        config.dedup.phash_threshold, config.dedup.dhash_threshold
    );
    for (source, count) in &by_source {
        println!("  {:<10} {}", source.as_str(), count);
    }
    if !dropped.is_empty() {
        println!("unparseable entries: {}", dropped.len());
    }
    Ok(())
}

/// Empty the dedup index. Stored images stay on disk.
pub fn run_index_clear(config: &Config, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to clear the hash index without --yes");
    }
    let store = open_store(config)?;
    let before = store.load_index()?.len();
    store.save_index(&IndexSnapshot::new())?;
    println!("hash index cleared ({} entries removed)", before);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::{IndexEntry, IndexMeta};
    use tempfile::TempDir;

    #[test]
    fn clear_needs_confirmation() {
        let dir = TempDir::new().unwrap();
        let config = Config::minimal(dir.path());
        let store = open_store(&config).unwrap();
        let mut snapshot = IndexSnapshot::new();
        snapshot.insert(
            "a".into(),
            IndexEntry {
                phash: "0000000000000000".into(),
                dhash: "ffffffffffffffff".into(),
                meta: IndexMeta {
                    property_hash: "3f9a12cc".into(),
                    source: ImageSource::Mls,
                    source_url: "https://cdn.flexmls.com/a.jpg".into(),
                },
            },
        );
        store.save_index(&snapshot).unwrap();

        assert!(run_index_clear(&config, false).is_err());
        assert_eq!(store.load_index().unwrap().len(), 1);

        run_index_clear(&config, true).unwrap();
        assert!(store.load_index().unwrap().is_empty());
    }
}
