//! Checkpoint manager — resumable batch runs
//!
//! A checkpoint is a directory holding the run state (processed index,
//! staged overlay, accumulated output records, the config the run started
//! with) plus online snapshots of both SQLite stores. Saved on a fixed cadence, on interrupt, and on
//! fatal error; a resumed run restores the stores byte-for-byte and picks
//! up at the item after the recorded index.

use crate::candidate::{CandidateError, CandidateRepository};
use crate::config::ConsolidationConfig;
use crate::embedding::{EmbeddingStore, StoreError};
use crate::graph::StagedConcept;
use crate::pipeline::OutputRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

const STATE_FILE: &str = "state.json";
const VECTORS_FILE: &str = "vectors.db";
const CANDIDATES_FILE: &str = "candidates.db";

/// Errors from checkpoint operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("vector store error: {0}")]
    Store(#[from] StoreError),

    #[error("candidate repository error: {0}")]
    Candidate(#[from] CandidateError),
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// The run state captured in a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Index of the last fully processed input item.
    pub processed_index: usize,
    /// The batch input this run was processing.
    pub batch_source: String,
    /// Staged ontology additions at checkpoint time.
    pub staged: Vec<StagedConcept>,
    /// Output records produced so far, so a resumed run's final artifact
    /// matches an uninterrupted one.
    #[serde(default)]
    pub accumulated_results: Vec<OutputRecord>,
    /// The config the run started with, for replay fidelity.
    pub config: ConsolidationConfig,
    pub created_at: DateTime<Utc>,
}

/// A checkpoint on disk, loaded or just written.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub name: String,
    pub path: PathBuf,
    pub state: CheckpointState,
}

impl Checkpoint {
    /// Restore both SQLite stores from this checkpoint's snapshots.
    pub fn restore_stores(
        &self,
        embeddings: &EmbeddingStore,
        candidates: &CandidateRepository,
    ) -> CheckpointResult<()> {
        embeddings.restore_from(self.path.join(VECTORS_FILE))?;
        candidates.restore_from(self.path.join(CANDIDATES_FILE))?;
        Ok(())
    }
}

/// Writes and loads checkpoints under a fixed directory.
///
/// Names are `checkpoint_<seq>_<timestamp>` with a zero-padded monotonic
/// sequence so lexicographic order is chronological even within one second.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a new checkpoint: state JSON plus store snapshots.
    pub fn save(
        &self,
        state: &CheckpointState,
        embeddings: &EmbeddingStore,
        candidates: &CandidateRepository,
    ) -> CheckpointResult<Checkpoint> {
        let seq = self
            .list()?
            .first()
            .and_then(|c| c.name.split('_').nth(1))
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let name = format!("checkpoint_{:04}_{}", seq, Utc::now().format("%Y%m%d%H%M%S"));
        let path = self.dir.join(&name);
        std::fs::create_dir_all(&path)?;

        std::fs::write(
            path.join(STATE_FILE),
            serde_json::to_string_pretty(state)?,
        )?;
        embeddings.backup_to(path.join(VECTORS_FILE))?;
        candidates.backup_to(path.join(CANDIDATES_FILE))?;

        info!(
            checkpoint = %name,
            processed_index = state.processed_index,
            staged = state.staged.len(),
            "checkpoint saved"
        );
        Ok(Checkpoint {
            name,
            path,
            state: state.clone(),
        })
    }

    /// All checkpoints, newest first. Directories without a readable state
    /// file are ignored.
    pub fn list(&self) -> CheckpointResult<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        if !self.dir.exists() {
            return Ok(checkpoints);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.path().is_dir() || !name.starts_with("checkpoint_") {
                continue;
            }
            let state_path = entry.path().join(STATE_FILE);
            let Ok(raw) = std::fs::read_to_string(&state_path) else {
                continue;
            };
            let Ok(state) = serde_json::from_str::<CheckpointState>(&raw) else {
                continue;
            };
            checkpoints.push(Checkpoint {
                name,
                path: entry.path(),
                state,
            });
        }
        checkpoints.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(checkpoints)
    }

    /// The newest checkpoint, if any.
    pub fn load_latest(&self) -> CheckpointResult<Option<Checkpoint>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Delete all but the newest `keep` checkpoints.
    pub fn prune(&self, keep: usize) -> CheckpointResult<usize> {
        let checkpoints = self.list()?;
        let mut removed = 0;
        for checkpoint in checkpoints.iter().skip(keep) {
            std::fs::remove_dir_all(&checkpoint.path)?;
            removed += 1;
        }
        Ok(removed)
    }
}
