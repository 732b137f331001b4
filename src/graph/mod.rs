//! Ontology graph: durable store collaborator and the two-view manager

mod manager;
mod store;

pub use manager::{OntologyGraphManager, StagedConcept, View};
pub use store::{
    ConceptRecord, GraphResult, GraphStore, GraphStoreError, MemoryGraphStore, SparqlGraphStore,
};
