//! Durable record of completed LOOCV folds.
//!
//! The checkpoint is a single JSON document rewritten atomically: the new content goes to
//! a temporary file in the same directory, is synced, and then renamed over the old file,
//! so a crash leaves either the previous or the new checkpoint on disk.

use crate::loocv::FoldOutcome;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const CHECKPOINT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Identifies the batch a checkpoint belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub content_hash: String,
    pub fold_count: usize,
    /// Fingerprint of the full-population parameters every fold warm starts from.
    pub params_fingerprint: String,
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    version: u32,
    key: CheckpointKey,
    folds: Vec<FoldOutcome>,
}

#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    key: CheckpointKey,
    folds: Vec<FoldOutcome>,
    unflushed: usize,
}

impl CheckpointStore {
    /// Opens the checkpoint at `path`. Folds are restored only when the stored key
    /// matches `key`; an unreadable or foreign checkpoint is discarded with a warning.
    pub fn open(path: &Path, key: CheckpointKey) -> Result<Self, CheckpointError> {
        let mut store = Self {
            path: path.to_path_buf(),
            key,
            folds: Vec::new(),
            unflushed: 0,
        };
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(store),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: store.path,
                    source,
                });
            }
        };
        match serde_json::from_slice::<CheckpointFile>(&bytes) {
            Ok(file) if file.version == CHECKPOINT_VERSION && file.key == store.key => {
                log::info!(
                    "Restored {} completed folds from checkpoint '{}'.",
                    file.folds.len(),
                    path.display()
                );
                store.folds = file.folds;
            }
            Ok(_) => log::warn!(
                "Discarding checkpoint '{}': it belongs to a different data set or fit.",
                path.display()
            ),
            Err(e) => log::warn!("Discarding unreadable checkpoint '{}': {e}", path.display()),
        }
        Ok(store)
    }

    pub fn restored(&self) -> &[FoldOutcome] {
        &self.folds
    }

    /// Folds recorded since the last flush.
    pub fn unflushed(&self) -> usize {
        self.unflushed
    }

    pub fn record(&mut self, outcome: FoldOutcome) {
        self.folds.push(outcome);
        self.unflushed += 1;
    }

    pub fn flush(&mut self) -> Result<(), CheckpointError> {
        let file = CheckpointFile {
            version: CHECKPOINT_VERSION,
            key: self.key.clone(),
            folds: self.folds.clone(),
        };
        let io_err = |source: io::Error| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(io_err)?;
        let temp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer(&mut writer, &file)?;
            writer.flush().map_err(io_err)?;
        }
        temp.as_file().sync_all().map_err(io_err)?;
        temp.persist(&self.path).map_err(|e| io_err(e.error))?;
        log::debug!(
            "Checkpointed {} folds to '{}'.",
            self.folds.len(),
            self.path.display()
        );
        self.unflushed = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loocv::FoldState;
    use crate::types::PersonIndex;

    fn key() -> CheckpointKey {
        CheckpointKey {
            content_hash: "abc".to_string(),
            fold_count: 3,
            params_fingerprint: "fff".to_string(),
        }
    }

    fn failed_fold(i: usize) -> FoldOutcome {
        FoldOutcome {
            person_id: format!("p{i}"),
            person: PersonIndex::new(i),
            state: FoldState::Failed {
                reason: "did not converge".to_string(),
            },
            status: None,
            fit: None,
            iterations: 7,
            elapsed_secs: 0.5,
        }
    }

    #[test]
    fn flushed_folds_are_restored_under_the_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("loocv.json");
        let mut store = CheckpointStore::open(&path, key()).unwrap();
        assert!(store.restored().is_empty());
        store.record(failed_fold(0));
        store.record(failed_fold(2));
        assert_eq!(store.unflushed(), 2);
        store.flush().unwrap();
        assert_eq!(store.unflushed(), 0);

        let reopened = CheckpointStore::open(&path, key()).unwrap();
        assert_eq!(reopened.restored(), &[failed_fold(0), failed_fold(2)]);
    }

    #[test]
    fn foreign_checkpoint_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loocv.json");
        let mut store = CheckpointStore::open(&path, key()).unwrap();
        store.record(failed_fold(1));
        store.flush().unwrap();

        let other = CheckpointKey {
            params_fingerprint: "000".to_string(),
            ..key()
        };
        assert!(CheckpointStore::open(&path, other).unwrap().restored().is_empty());
    }

    #[test]
    fn corrupt_checkpoint_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loocv.json");
        fs::write(&path, b"{ not json").unwrap();
        let store = CheckpointStore::open(&path, key()).unwrap();
        assert!(store.restored().is_empty());
        assert_eq!(store.unflushed(), 0);
    }
}
