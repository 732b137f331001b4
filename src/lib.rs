//! OntoMerge: Concept Consolidation Engine
//!
//! Grows a concept ontology from a stream of observed keywords. Each input
//! item is matched against the existing ontology by vector search plus an
//! Oracle judgment; misses accumulate as candidates, candidates are grouped
//! by density-based clustering, and coherent clusters are promoted into
//! staged concepts. Staged state becomes durable only through an explicit
//! reviewed commit, which can be rolled back from an automatic backup.
//!
//! # Core pieces
//!
//! - **EmbeddingStore**: committed and staged concept vectors, exclusion-aware
//!   nearest-neighbor search
//! - **CandidateRepository** + **ClusterEngine**: unmatched observations and
//!   their DBSCAN grouping
//! - **OntologyGraphManager**: in-memory committed/staged views of the graph
//! - **Coordinator**: backup, topological commit, and rollback
//! - **BatchRunner**: checkpointed, resumable batch processing
//!
//! # Example
//!
//! ```
//! use ontomerge::ConsolidationConfig;
//!
//! let config = ConsolidationConfig::default().with_root("Root");
//! assert_eq!(config.min_promotable_size, 5);
//! ```

pub mod candidate;
pub mod checkpoint;
pub mod config;
pub mod embedding;
pub mod graph;
pub mod oracle;
pub mod pipeline;
pub mod staging;

pub use candidate::{Candidate, CandidateRepository, Cluster, NewCandidate};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointState};
pub use config::ConsolidationConfig;
pub use embedding::{Embedder, EmbeddingStore, HttpEmbedder, ScoredConcept, StubEmbedder};
pub use graph::{
    ConceptRecord, GraphStore, MemoryGraphStore, OntologyGraphManager, SparqlGraphStore,
    StagedConcept, View,
};
pub use oracle::{ConceptOracle, HttpOracle, MockOracle, OracleError};
pub use pipeline::{
    BatchItem, BatchReport, BatchRunner, ConceptMatcher, PipelineError, PipelineResult,
};
pub use staging::{CommitReport, Coordinator, Mutation, StagingChangeSet, StagingError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
