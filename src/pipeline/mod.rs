//! Consolidation pipeline — matching state machine and batch driver
//!
//! `ConceptMatcher` runs one input item through the extract → search →
//! match → save → cluster-check → promote sequence; `BatchRunner` drives a
//! JSONL batch through it with checkpointing, interrupt handling, and a
//! final rematch pass over still-unmatched candidates.

mod batch;
mod matcher;
mod rematch;

pub use batch::{BatchReport, BatchRunner, OutputRecord};
pub use matcher::{ConceptMatcher, ItemOutcome, MatchPhase};
pub use rematch::RematchReport;

use crate::candidate::CandidateError;
use crate::checkpoint::CheckpointError;
use crate::embedding::{EmbeddingError, StoreError};
use crate::graph::GraphStoreError;
use crate::oracle::OracleError;
use crate::staging::StagingError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that abort a pipeline run.
///
/// Everything here is infrastructure: the run checkpoints and stops, and a
/// resumed run picks up where it left off. Data problems (malformed input
/// lines) and decision outcomes (no match, cluster not promotable) never
/// surface as errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("vector store error: {0}")]
    Store(#[from] StoreError),

    #[error("candidate repository error: {0}")]
    Candidate(#[from] CandidateError),

    #[error("graph store error: {0}")]
    Graph(#[from] GraphStoreError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("staging error: {0}")]
    Staging(#[from] StagingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// One input item from a batch file: an observed keyword with its source
/// document context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    /// The observed keyword or concept mention.
    pub concept: String,
    #[serde(default)]
    pub section_id: String,
    #[serde(default)]
    pub section_title: String,
    #[serde(default)]
    pub chunk_text: String,
}

impl BatchItem {
    /// The document context handed to the Oracle.
    pub fn context(&self) -> String {
        if self.section_title.is_empty() {
            self.chunk_text.clone()
        } else {
            format!("{}\n{}", self.section_title, self.chunk_text)
        }
    }
}
