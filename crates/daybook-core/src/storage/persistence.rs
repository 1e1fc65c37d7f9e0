//! Replica snapshot persistence
//!
//! Each domain's replica is saved as one JSON file holding its records, the
//! mutations still waiting for the server, and the client id those mutations
//! were issued under. Writes are atomic (temp file, fsync, rename) so a crash
//! never leaves a half-written snapshot.
//!
//! Storage location: `<data_dir>/<domain>.json`

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{StorageError, StorageResult};
use crate::models::Entity;
use crate::mutation::MutationRecord;

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk contents of one domain's replica
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaFile<F> {
    pub version: u32,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub next_mutation_id: u64,
    #[serde(default)]
    pub pending: Vec<MutationRecord>,
    #[serde(default = "Vec::new")]
    pub records: Vec<(String, Entity<F>)>,
}

impl<F> ReplicaFile<F> {
    /// An empty snapshot for a new client
    pub fn empty(client_id: impl Into<String>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            client_id: client_id.into(),
            next_mutation_id: 1,
            pending: Vec::new(),
            records: Vec::new(),
        }
    }
}

/// Reads and writes one domain's snapshot file
#[derive(Debug, Clone)]
pub struct ReplicaPersistence {
    path: PathBuf,
}

impl ReplicaPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file for `domain` under `data_dir`
    pub fn for_domain(data_dir: &Path, domain: &str) -> Self {
        Self::new(data_dir.join(format!("{}.json", domain)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the snapshot
    ///
    /// Returns `None` if no snapshot has been written yet. A file that cannot
    /// be parsed is renamed to `<name>.corrupt` and reported as
    /// [`StorageError::CorruptSnapshot`].
    pub fn load<F: DeserializeOwned>(&self) -> StorageResult<Option<ReplicaFile<F>>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::ReadError {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        match serde_json::from_slice::<ReplicaFile<F>>(&bytes) {
            Ok(file) => {
                debug!(
                    "Loaded {} record(s) and {} pending mutation(s) from {:?}",
                    file.records.len(),
                    file.pending.len(),
                    self.path
                );
                Ok(Some(file))
            }
            Err(e) => {
                let backup_path = self.path.with_extension("json.corrupt");
                warn!("Snapshot {:?} is unreadable: {}", self.path, e);
                fs::rename(&self.path, &backup_path)
                    .map_err(|err| StorageError::from_io(err, backup_path.clone()))?;
                Err(StorageError::CorruptSnapshot {
                    path: self.path.clone(),
                    backup_path,
                    details: e.to_string(),
                })
            }
        }
    }

    /// Save the snapshot atomically
    pub fn save<F: Serialize>(&self, file: &ReplicaFile<F>) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(file).map_err(|e| StorageError::Encode {
            path: self.path.clone(),
            details: e.to_string(),
        })?;
        atomic_write(&self.path, &bytes)
    }

    /// Remove the snapshot if present
    pub fn delete(&self) -> StorageResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(e, self.path.clone())),
        }
    }
}

/// Write `data` to `path` without ever exposing a partial file
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::CreateDirectory {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| StorageError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|e| StorageError::AtomicWriteFailed {
        from: temp_path.clone(),
        to: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiaryEntry;
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample() -> ReplicaFile<DiaryEntry> {
        let mut file = ReplicaFile::empty("client-1");
        file.records.push((
            "entry/a".to_string(),
            Entity::new(
                "a",
                DiaryEntry {
                    title: "Monday".to_string(),
                    body: "Rain".to_string(),
                },
            ),
        ));
        file.pending.push(MutationRecord {
            id: 1,
            name: "createEntry".to_string(),
            args: serde_json::json!({"id": "a", "title": "Monday"}),
            client_generated_id: Some("a".to_string()),
            issued_at: Utc::now(),
        });
        file.next_mutation_id = 2;
        file
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = ReplicaPersistence::for_domain(temp_dir.path(), "diary");

        assert!(!persistence.exists());
        assert!(persistence.load::<DiaryEntry>().unwrap().is_none());

        let file = sample();
        persistence.save(&file).unwrap();
        assert!(persistence.exists());
        assert!(persistence.path().ends_with("diary.json"));

        let loaded = persistence.load::<DiaryEntry>().unwrap().unwrap();
        assert_eq!(loaded, file);
    }

    #[test]
    fn test_save_creates_missing_directories() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b");
        let persistence = ReplicaPersistence::for_domain(&nested, "food");

        persistence.save(&sample()).unwrap();
        assert!(nested.join("food.json").exists());
        assert!(!nested.join("food.tmp").exists());
    }

    #[test]
    fn test_corrupt_snapshot_is_set_aside() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = ReplicaPersistence::for_domain(temp_dir.path(), "ideas");
        fs::write(persistence.path(), b"{ not json").unwrap();

        let err = persistence.load::<DiaryEntry>().unwrap_err();
        assert!(matches!(err, StorageError::CorruptSnapshot { .. }));
        assert!(!persistence.exists());
        assert!(temp_dir.path().join("ideas.json.corrupt").exists());

        // The next load starts fresh
        assert!(persistence.load::<DiaryEntry>().unwrap().is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = ReplicaPersistence::for_domain(temp_dir.path(), "diary");
        persistence.save(&sample()).unwrap();

        persistence.delete().unwrap();
        persistence.delete().unwrap();
        assert!(!persistence.exists());
    }
}
