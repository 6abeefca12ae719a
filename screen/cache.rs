//! Provenance-keyed cache of completed screening runs.
//!
//! A full LOOCV batch is the expensive part of a screening run. Its results are stored as
//! a `ScreeningArtifact` in TOML, next to the LOOCV checkpoint, and reused as long as the
//! provenance keys still describe the current input. A cache directory holds one run;
//! any other input finds that run and is told it is stale.

use crate::config::ScreeningConfig;
use crate::estimate::FitDiagnostics;
use crate::loocv::{FoldOutcome, LoocvSummary};
use crate::model::ParameterSet;
use crate::optimize::ConvergenceStatus;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const ARTIFACT_FILE: &str = "screening.toml";
const CHECKPOINT_FILE: &str = "loocv-checkpoint.json";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse cached artifact '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize screening artifact: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error(
        "Cached run is stale: {field} is '{found}' but the current input has '{expected}'. Rerun with rebuild enabled."
    )]
    Stale {
        field: &'static str,
        expected: String,
        found: String,
    },
}

/// Keys a cached run must match to be reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub item_set_hash: String,
    pub content_hash: String,
    pub fold_count: usize,
    /// Hash of the model and optimizer settings the run was fitted with.
    pub settings_hash: String,
}

impl CacheKey {
    pub fn new(item_set_hash: &str, content_hash: &str, fold_count: usize, config: &ScreeningConfig) -> Self {
        Self {
            item_set_hash: item_set_hash.to_string(),
            content_hash: content_hash.to_string(),
            fold_count,
            settings_hash: settings_hash(config),
        }
    }
}

/// Hash of the settings that change fitted values.
fn settings_hash(config: &ScreeningConfig) -> String {
    let mut hasher = Sha256::new();
    for section in [
        toml::to_string(&config.vectorize),
        toml::to_string(&config.model),
        toml::to_string(&config.optimizer),
    ] {
        hasher.update(section.unwrap_or_default().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub item_set_hash: String,
    pub content_hash: String,
    pub fold_count: usize,
    pub settings_hash: String,
    pub convergence_failures: usize,
    pub skipped: usize,
    pub engine_version: String,
    pub created_unix: u64,
}

impl Provenance {
    pub fn new(key: &CacheKey, summary: &LoocvSummary) -> Self {
        Self {
            item_set_hash: key.item_set_hash.clone(),
            content_hash: key.content_hash.clone(),
            fold_count: key.fold_count,
            settings_hash: key.settings_hash.clone(),
            convergence_failures: summary.failed,
            skipped: summary.skipped,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            created_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

/// Everything needed to score new respondents without refitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningArtifact {
    pub provenance: Provenance,
    pub full_fit_status: ConvergenceStatus,
    pub full_fit: FitDiagnostics,
    pub params: ParameterSet,
    pub summary: LoocvSummary,
    pub folds: Vec<FoldOutcome>,
}

impl ScreeningArtifact {
    /// Checks the provenance keys against the current input.
    pub fn validate(&self, expected: &CacheKey) -> Result<(), CacheError> {
        let p = &self.provenance;
        let checks = [
            ("item_set_hash", &expected.item_set_hash, &p.item_set_hash),
            ("content_hash", &expected.content_hash, &p.content_hash),
            ("settings_hash", &expected.settings_hash, &p.settings_hash),
        ];
        for (field, want, have) in checks {
            if want != have {
                return Err(CacheError::Stale {
                    field,
                    expected: want.clone(),
                    found: have.clone(),
                });
            }
        }
        if expected.fold_count != p.fold_count {
            return Err(CacheError::Stale {
                field: "fold_count",
                expected: expected.fold_count.to_string(),
                found: p.fold_count.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
}

impl ArtifactCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.dir.join(ARTIFACT_FILE)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    /// Loads the cached run and checks it against `key`. A missing artifact is `Ok(None)`;
    /// an artifact whose provenance no longer matches is `CacheError::Stale`.
    pub fn load(&self, key: &CacheKey) -> Result<Option<ScreeningArtifact>, CacheError> {
        let path = self.artifact_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        let artifact: ScreeningArtifact =
            toml::from_str(&text).map_err(|source| CacheError::Parse { path: path.clone(), source })?;
        artifact.validate(key)?;
        log::info!("Loaded cached screening run from '{}'.", path.display());
        Ok(Some(artifact))
    }

    pub fn store(&self, artifact: &ScreeningArtifact) -> Result<PathBuf, CacheError> {
        let path = self.artifact_path();
        let text = toml::to_string(artifact)?;
        let io_err = |source: io::Error| CacheError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        temp.write_all(text.as_bytes()).map_err(io_err)?;
        temp.as_file().sync_all().map_err(io_err)?;
        temp.persist(&path).map_err(|e| io_err(e.error))?;
        log::info!("Stored screening run in '{}'.", path.display());
        Ok(path)
    }

    /// Removes the cached run and the LOOCV checkpoint.
    pub fn invalidate(&self) -> Result<(), CacheError> {
        remove_if_present(self.artifact_path())?;
        remove_if_present(self.checkpoint_path())
    }

    /// Removes the LOOCV checkpoint once its folds live in a stored artifact.
    pub fn discard_checkpoint(&self) -> Result<(), CacheError> {
        remove_if_present(self.checkpoint_path())
    }
}

fn remove_if_present(path: PathBuf) -> Result<(), CacheError> {
    match fs::remove_file(&path) {
        Ok(()) => {
            log::info!("Removed cached file '{}'.", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CacheError::Io { path, source }),
    }
}
