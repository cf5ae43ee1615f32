//! Crash-safe persistence for everything under the metadata directory.
//!
//! | File | Contents |
//! |------|----------|
//! | `extraction_state.json` | completed / failed addresses ([`ExtractionState`]) |
//! | `hash_index.json` | the dedup index snapshot |
//! | `image_manifest.json` | stored artifacts per property |
//! | `address_folders.json` | address → artifact folder |
//! | `run_history.json` | one [`RunRecord`] per run |
//! | `backups/` | timestamped copies of `extraction_state.json` |
//!
//! Every write goes to a uniquely named temp file in the same directory,
//! is flushed to disk, then renamed over the primary and the directory is
//! synced. A crash at any point leaves either the old or the new file; stray
//! temp files are never read.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::dedup::IndexSnapshot;
use crate::error::StateError;
use crate::models::{AddressFolders, ExtractionState, ImageManifest, RunRecord};

pub const STATE_FILE: &str = "extraction_state.json";
pub const INDEX_FILE: &str = "hash_index.json";
pub const MANIFEST_FILE: &str = "image_manifest.json";
pub const FOLDERS_FILE: &str = "address_folders.json";
pub const HISTORY_FILE: &str = "run_history.json";
pub const BACKUP_DIR: &str = "backups";

const BACKUP_PREFIX: &str = "extraction_state.";
const PRE_RESTORE_SUFFIX: &str = ".pre-restore.json";

/// A backup file as listed by [`StateManager::list_backups`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub name: String,
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size_bytes: u64,
}

impl BackupInfo {
    pub fn is_pre_restore(&self) -> bool {
        self.name.ends_with(PRE_RESTORE_SUFFIX)
    }
}

pub struct StateManager {
    dir: PathBuf,
    retention: usize,
}

impl StateManager {
    /// Open (creating if needed) a metadata directory. `retention` is the
    /// number of state backups kept; at least one is always kept.
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Result<Self, StateError> {
        let dir = dir.into();
        let backups = dir.join(BACKUP_DIR);
        fs::create_dir_all(&backups).map_err(|e| StateError::io(&backups, e))?;
        Ok(Self {
            dir,
            retention: retention.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn backup_dir(&self) -> PathBuf {
        self.dir.join(BACKUP_DIR)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Extraction state
    // ═══════════════════════════════════════════════════════════════════

    /// Load the extraction state.
    ///
    /// A missing file is an empty state. A corrupt file falls back to the
    /// newest backup that parses; if none does, [`StateError::Corrupt`].
    pub fn load_state(&self) -> Result<ExtractionState, StateError> {
        let path = self.path(STATE_FILE);
        let reason = match read_json::<ExtractionState>(&path) {
            Ok(Some(state)) => return Ok(state),
            Ok(None) => return Ok(ExtractionState::default()),
            Err(StateError::Corrupt { reason, .. }) => reason,
            Err(e) => return Err(e),
        };

        warn!(path = %path.display(), %reason, "state file corrupt, trying backups");
        for backup in self.list_backups()? {
            match read_json::<ExtractionState>(&backup.path) {
                Ok(Some(state)) => {
                    warn!(backup = %backup.name, "recovered state from backup");
                    return Ok(state);
                }
                _ => warn!(backup = %backup.name, "backup unusable"),
            }
        }
        Err(StateError::Corrupt { path, reason })
    }

    /// Back up the current state file, write the new one atomically, then
    /// prune old backups.
    pub fn save_state(&self, state: &ExtractionState) -> Result<(), StateError> {
        self.create_backup()?;
        write_json_atomic(&self.path(STATE_FILE), state)?;
        self.prune_backups()
    }

    /// Copy the current state file into `backups/`. Returns `None` when
    /// there is no state file yet.
    pub fn create_backup(&self) -> Result<Option<PathBuf>, StateError> {
        self.backup_as("")
    }

    fn backup_as(&self, tag: &str) -> Result<Option<PathBuf>, StateError> {
        let primary = self.path(STATE_FILE);
        let bytes = match fs::read(&primary) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(&primary, e)),
        };

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string();
        let mut target = self
            .backup_dir()
            .join(format!("{}{}{}.json", BACKUP_PREFIX, stamp, tag));
        let mut n = 1;
        while target.exists() {
            target = self
                .backup_dir()
                .join(format!("{}{}-{}{}.json", BACKUP_PREFIX, stamp, n, tag));
            n += 1;
        }
        write_atomic(&target, &bytes)?;
        Ok(Some(target))
    }

    /// Backups, newest first (modification time, then file name).
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, StateError> {
        let dir = self.backup_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateError::io(&dir, e)),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StateError::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(BACKUP_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            let meta = entry.metadata().map_err(|e| StateError::io(entry.path(), e))?;
            if !meta.is_file() {
                continue;
            }
            backups.push(BackupInfo {
                name,
                path: entry.path(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size_bytes: meta.len(),
            });
        }
        backups.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(backups)
    }

    fn prune_backups(&self) -> Result<(), StateError> {
        for old in self.list_backups()?.into_iter().skip(self.retention) {
            fs::remove_file(&old.path).map_err(|e| StateError::io(&old.path, e))?;
        }
        Ok(())
    }

    /// Replace the state file with a backup.
    ///
    /// `None` picks the newest regular backup; `Some(name)` picks a backup
    /// by file name. The current state file is first saved as a
    /// `*.pre-restore.json` backup, so a restore can itself be undone.
    pub fn restore_from_backup(&self, name: Option<&str>) -> Result<ExtractionState, StateError> {
        let backups = self.list_backups()?;
        let chosen = match name {
            Some(name) => backups
                .into_iter()
                .find(|b| b.name == name)
                .ok_or_else(|| StateError::BackupNotFound(name.to_string()))?,
            None => backups
                .into_iter()
                .find(|b| !b.is_pre_restore())
                .ok_or_else(|| StateError::BackupNotFound("no backups available".to_string()))?,
        };

        let state = read_json::<ExtractionState>(&chosen.path)?
            .ok_or_else(|| StateError::BackupNotFound(chosen.name.clone()))?;

        self.backup_as(".pre-restore")?;
        write_json_atomic(&self.path(STATE_FILE), &state)?;
        info!(backup = %chosen.name, "state restored from backup");
        self.prune_backups()?;
        Ok(state)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Run history
    // ═══════════════════════════════════════════════════════════════════

    pub fn append_run_record(&self, record: &RunRecord) -> Result<(), StateError> {
        let mut history = self.run_history()?;
        history.push(record.clone());
        write_json_atomic(&self.path(HISTORY_FILE), &history)
    }

    /// All recorded runs, oldest first.
    pub fn run_history(&self) -> Result<Vec<RunRecord>, StateError> {
        Ok(read_json(&self.path(HISTORY_FILE))?.unwrap_or_default())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Index, manifest, folders
    // ═══════════════════════════════════════════════════════════════════

    pub fn load_index(&self) -> Result<IndexSnapshot, StateError> {
        Ok(read_json(&self.path(INDEX_FILE))?.unwrap_or_default())
    }

    pub fn save_index(&self, snapshot: &IndexSnapshot) -> Result<(), StateError> {
        write_json_atomic(&self.path(INDEX_FILE), snapshot)
    }

    pub fn load_manifest(&self) -> Result<ImageManifest, StateError> {
        Ok(read_json(&self.path(MANIFEST_FILE))?.unwrap_or_default())
    }

    pub fn save_manifest(&self, manifest: &ImageManifest) -> Result<(), StateError> {
        write_json_atomic(&self.path(MANIFEST_FILE), manifest)
    }

    pub fn load_address_folders(&self) -> Result<AddressFolders, StateError> {
        Ok(read_json(&self.path(FOLDERS_FILE))?.unwrap_or_default())
    }

    pub fn save_address_folders(&self, folders: &AddressFolders) -> Result<(), StateError> {
        write_json_atomic(&self.path(FOLDERS_FILE), folders)
    }
}

/// `Ok(None)` if the file does not exist.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StateError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StateError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StateError> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

/// Write `bytes` to `path` via temp file, fsync and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(StateError::io(path, e));
    }
    sync_dir(dir).map_err(|e| StateError::io(dir, e))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::{IndexEntry, IndexMeta};
    use crate::models::ImageSource;
    use tempfile::TempDir;

    fn state_with(addresses: &[&str]) -> ExtractionState {
        let mut state = ExtractionState::default();
        for a in addresses {
            state.mark_completed(a);
        }
        state
    }

    fn manager(dir: &TempDir, retention: usize) -> StateManager {
        StateManager::new(dir.path().join("metadata"), retention).unwrap()
    }

    #[test]
    fn missing_files_load_as_empty() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 10);
        assert_eq!(m.load_state().unwrap(), ExtractionState::default());
        assert!(m.load_index().unwrap().is_empty());
        assert!(m.load_manifest().unwrap().is_empty());
        assert!(m.load_address_folders().unwrap().is_empty());
        assert!(m.run_history().unwrap().is_empty());
        assert!(m.list_backups().unwrap().is_empty());
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 10);
        let state = state_with(&["123 Main St"]);
        m.save_state(&state).unwrap();
        assert_eq!(m.load_state().unwrap(), state);
        // first save had nothing to back up
        assert!(m.list_backups().unwrap().is_empty());
    }

    #[test]
    fn backups_are_pruned_to_retention() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 3);
        for i in 0..8 {
            m.save_state(&state_with(&[&format!("{} Elm St", i)])).unwrap();
        }
        let backups = m.list_backups().unwrap();
        assert_eq!(backups.len(), 3);
        // newest backup holds the state written just before the last save
        let newest: ExtractionState =
            serde_json::from_slice(&fs::read(&backups[0].path).unwrap()).unwrap();
        assert!(newest.is_completed("6 Elm St"));
    }

    #[test]
    fn leftover_temp_file_from_crash_is_ignored() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 10);
        let old = state_with(&["1 Old Rd"]);
        m.save_state(&old).unwrap();

        // crash after the temp file was partly written, before the rename
        let partial = m.dir().join(format!(".{}.deadbeef.tmp", STATE_FILE));
        fs::write(&partial, br#"{"completed": ["2 New R"#).unwrap();
        assert_eq!(m.load_state().unwrap(), old);

        // crash after the rename: the new state is complete
        let new = state_with(&["1 Old Rd", "2 New Rd"]);
        m.save_state(&new).unwrap();
        assert_eq!(m.load_state().unwrap(), new);
        assert!(partial.exists());
        assert!(m.list_backups().unwrap().iter().all(|b| !b.name.ends_with(".tmp")));
    }

    #[test]
    fn corrupt_state_falls_back_to_newest_backup() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 10);
        m.save_state(&state_with(&["1 A St"])).unwrap();
        m.save_state(&state_with(&["1 A St", "2 B St"])).unwrap();
        fs::write(m.path(STATE_FILE), b"{ not json").unwrap();

        let recovered = m.load_state().unwrap();
        assert!(recovered.is_completed("1 A St"));
        assert!(!recovered.is_completed("2 B St"));
    }

    #[test]
    fn corrupt_state_without_backups_is_an_error() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 10);
        fs::write(m.path(STATE_FILE), b"garbage").unwrap();
        assert!(matches!(m.load_state(), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn restore_is_never_destructive() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 10);
        let first = state_with(&["1 A St"]);
        let second = state_with(&["1 A St", "2 B St"]);
        m.save_state(&first).unwrap();
        m.save_state(&second).unwrap();

        let restored = m.restore_from_backup(None).unwrap();
        assert_eq!(restored, first);
        assert_eq!(m.load_state().unwrap(), first);

        let pre = m
            .list_backups()
            .unwrap()
            .into_iter()
            .find(|b| b.is_pre_restore())
            .unwrap();
        let undone = m.restore_from_backup(Some(&pre.name)).unwrap();
        assert_eq!(undone, second);
    }

    #[test]
    fn restore_unknown_backup() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 10);
        assert!(matches!(
            m.restore_from_backup(None),
            Err(StateError::BackupNotFound(_))
        ));
        assert!(matches!(
            m.restore_from_backup(Some("extraction_state.nope.json")),
            Err(StateError::BackupNotFound(_))
        ));
    }

    #[test]
    fn run_history_appends_in_order() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 10);
        for i in 0..3 {
            let now = Utc::now();
            m.append_run_record(&RunRecord {
                run_id: format!("run-{}", i),
                started_at: now,
                finished_at: now,
                properties_requested: 1,
                properties_completed: 1,
                properties_failed: 0,
                properties_skipped: 0,
                images_extracted: i,
                duplicates_skipped: 0,
                sources_used: vec![ImageSource::Zillow],
                sources_blocked: vec![],
                dry_run: false,
                cancelled: false,
                notes: vec![],
            })
            .unwrap();
        }
        let ids: Vec<String> = m.run_history().unwrap().into_iter().map(|r| r.run_id).collect();
        assert_eq!(ids, ["run-0", "run-1", "run-2"]);
    }

    #[test]
    fn index_and_folders_round_trip() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 10);
        let mut snapshot = IndexSnapshot::new();
        snapshot.insert(
            "img-1".into(),
            IndexEntry {
                phash: "00ff00ff00ff00ff".into(),
                dhash: "0123456789abcdef".into(),
                meta: IndexMeta {
                    property_hash: "3f9a12cc".into(),
                    source: ImageSource::Redfin,
                    source_url: "https://ssl.cdn-redfin.com/a.jpg".into(),
                },
            },
        );
        m.save_index(&snapshot).unwrap();
        assert_eq!(m.load_index().unwrap(), snapshot);

        let mut folders = AddressFolders::new();
        folders.insert("123 Main St".into(), "3f9a12cc".into());
        m.save_address_folders(&folders).unwrap();
        assert_eq!(m.load_address_folders().unwrap(), folders);
    }
}
