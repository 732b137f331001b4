//! Embedding seam and vector storage
//!
//! `Embedder` abstracts the text-to-vector model (an external collaborator);
//! `EmbeddingStore` holds (concept_id, description, embedding) tuples in
//! committed and staged partitions and answers exclusion-aware
//! nearest-neighbor queries.

mod embedder;
mod store;

pub use embedder::{
    cosine_distance, l2_normalize, Embedder, EmbeddingError, HttpEmbedder, StubEmbedder,
};
pub use store::{EmbeddingStore, ScoredConcept, StoreError, StoreResult};
