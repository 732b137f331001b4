//! Graph store collaborator — the durable ontology graph
//!
//! The consolidation engine treats the graph database as an external,
//! SPARQL-like service. `GraphStore` is the typed seam; `SparqlGraphStore`
//! talks to a real endpoint over HTTP, `MemoryGraphStore` backs tests and
//! local runs. Only the staging Coordinator issues mutations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;

/// Errors from graph store operations
#[derive(Debug, Error)]
pub enum GraphStoreError {
    #[error("graph endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("graph query failed: {0}")]
    QueryFailed(String),

    #[error("graph update failed (HTTP {status}): {body}")]
    UpdateFailed { status: u16, body: String },

    #[error("malformed query response: {0}")]
    MalformedResponse(String),
}

/// Result type for graph store operations
pub type GraphResult<T> = Result<T, GraphStoreError>;

/// A committed concept as stored in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptRecord {
    pub id: String,
    pub label: String,
    /// Single primary parent; only the root has none.
    pub parent_id: Option<String>,
    pub description: String,
}

/// Trait for the durable graph store.
///
/// Implementations must be thread-safe (Send + Sync). `all_concepts()` is
/// the inventory dump used for backups and rollback diffing.
pub trait GraphStore: Send + Sync {
    /// Whether a concept exists in the durable graph.
    fn exists(&self, concept_id: &str) -> GraphResult<bool>;

    /// Insert a concept class under its parent.
    fn insert_concept(&self, record: &ConceptRecord) -> GraphResult<()>;

    /// Delete a concept and every statement about it.
    fn delete_concept(&self, concept_id: &str) -> GraphResult<()>;

    /// Add a symmetric "related" edge between two concepts.
    fn add_relation(&self, a: &str, b: &str) -> GraphResult<()>;

    /// Full concept inventory, in stable id order.
    fn all_concepts(&self) -> GraphResult<Vec<ConceptRecord>>;
}

/// In-memory graph store for tests and local runs.
pub struct MemoryGraphStore {
    concepts: RwLock<BTreeMap<String, ConceptRecord>>,
    relations: RwLock<HashSet<(String, String)>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self {
            concepts: RwLock::new(BTreeMap::new()),
            relations: RwLock::new(HashSet::new()),
        }
    }

    /// Seed with a set of records (handy for test fixtures).
    pub fn seeded(records: impl IntoIterator<Item = ConceptRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.concepts.write().unwrap();
            for record in records {
                map.insert(record.id.clone(), record);
            }
        }
        store
    }

    pub fn relation_count(&self) -> usize {
        self.relations.read().unwrap().len()
    }
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore for MemoryGraphStore {
    fn exists(&self, concept_id: &str) -> GraphResult<bool> {
        Ok(self.concepts.read().unwrap().contains_key(concept_id))
    }

    fn insert_concept(&self, record: &ConceptRecord) -> GraphResult<()> {
        self.concepts
            .write()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn delete_concept(&self, concept_id: &str) -> GraphResult<()> {
        self.concepts.write().unwrap().remove(concept_id);
        self.relations
            .write()
            .unwrap()
            .retain(|(a, b)| a != concept_id && b != concept_id);
        Ok(())
    }

    fn add_relation(&self, a: &str, b: &str) -> GraphResult<()> {
        let mut relations = self.relations.write().unwrap();
        relations.insert((a.to_string(), b.to_string()));
        relations.insert((b.to_string(), a.to_string()));
        Ok(())
    }

    fn all_concepts(&self) -> GraphResult<Vec<ConceptRecord>> {
        Ok(self.concepts.read().unwrap().values().cloned().collect())
    }
}

/// HTTP client for a SPARQL endpoint (GraphDB-style).
///
/// Queries go to the endpoint URL as `application/sparql-query`; updates to
/// `<endpoint>/statements` as `application/sparql-update`. Every request
/// carries a timeout so no call blocks indefinitely.
pub struct SparqlGraphStore {
    endpoint_url: String,
    prefix: String,
    agent: ureq::Agent,
}

impl SparqlGraphStore {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self::with_timeout(endpoint_url, Duration::from_secs(30))
    }

    pub fn with_timeout(endpoint_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            prefix: "http://example.org/ontology#".to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    fn preamble(&self) -> String {
        format!(
            "PREFIX onto: <{}>\n\
             PREFIX owl: <http://www.w3.org/2002/07/owl#>\n\
             PREFIX rdfs: <http://www.w3.org/2000/01/rdf-schema#>\n",
            self.prefix
        )
    }

    /// Escape quotes, backslashes and newlines for a SPARQL string literal.
    fn escape(text: &str) -> String {
        text.replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('\n', "\\n")
            .replace('\r', "\\r")
    }

    /// Strip a URI down to its local concept id.
    fn local_id(uri: &str) -> String {
        uri.rsplit(['#', '/']).next().unwrap_or(uri).to_string()
    }

    fn query(&self, sparql: &str) -> GraphResult<Vec<serde_json::Value>> {
        let response = self
            .agent
            .post(&self.endpoint_url)
            .set("Content-Type", "application/sparql-query")
            .set("Accept", "application/sparql-results+json")
            .send_string(sparql)
            .map_err(|e| GraphStoreError::Unreachable(e.to_string()))?;
        let body: serde_json::Value = response
            .into_json()
            .map_err(|e| GraphStoreError::MalformedResponse(e.to_string()))?;
        let bindings = body
            .get("results")
            .and_then(|r| r.get("bindings"))
            .and_then(|b| b.as_array())
            .ok_or_else(|| {
                GraphStoreError::MalformedResponse("missing results.bindings".to_string())
            })?;
        Ok(bindings.clone())
    }

    fn update(&self, sparql: &str) -> GraphResult<()> {
        let update_endpoint = format!("{}/statements", self.endpoint_url.trim_end_matches('/'));
        match self
            .agent
            .post(&update_endpoint)
            .set("Content-Type", "application/sparql-update")
            .send_string(sparql)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(status, response)) => Err(GraphStoreError::UpdateFailed {
                status,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(e) => Err(GraphStoreError::Unreachable(e.to_string())),
        }
    }

    fn binding_str(row: &serde_json::Value, key: &str) -> Option<String> {
        row.get(key)
            .and_then(|v| v.get("value"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

impl GraphStore for SparqlGraphStore {
    fn exists(&self, concept_id: &str) -> GraphResult<bool> {
        let sparql = format!(
            "{}SELECT ?s WHERE {{ onto:{} a owl:Class . }} LIMIT 1",
            self.preamble(),
            concept_id
        );
        Ok(!self.query(&sparql)?.is_empty())
    }

    fn insert_concept(&self, record: &ConceptRecord) -> GraphResult<()> {
        let parent_clause = match &record.parent_id {
            Some(parent) => format!("rdfs:subClassOf onto:{} ;\n    ", parent),
            None => String::new(),
        };
        let sparql = format!(
            "{}INSERT DATA {{\n  onto:{} a owl:Class ;\n    rdfs:label \"{}\"@en ;\n    \
             {}onto:description \"{}\" .\n}}",
            self.preamble(),
            record.id,
            Self::escape(&record.label),
            parent_clause,
            Self::escape(&record.description),
        );
        self.update(&sparql)
    }

    fn delete_concept(&self, concept_id: &str) -> GraphResult<()> {
        let sparql = format!(
            "{}DELETE WHERE {{ onto:{} ?p ?o . }}",
            self.preamble(),
            concept_id
        );
        self.update(&sparql)
    }

    fn add_relation(&self, a: &str, b: &str) -> GraphResult<()> {
        let sparql = format!(
            "{}INSERT DATA {{\n  onto:{a} onto:related onto:{b} .\n  \
             onto:{b} onto:related onto:{a} .\n}}",
            self.preamble(),
            a = a,
            b = b,
        );
        self.update(&sparql)
    }

    fn all_concepts(&self) -> GraphResult<Vec<ConceptRecord>> {
        let sparql = format!(
            "{}SELECT ?concept ?label ?parent ?description WHERE {{\n  \
             ?concept a owl:Class .\n  \
             OPTIONAL {{ ?concept rdfs:label ?label . }}\n  \
             OPTIONAL {{ ?concept rdfs:subClassOf ?parent . }}\n  \
             OPTIONAL {{ ?concept onto:description ?description . }}\n}} ORDER BY ?concept",
            self.preamble()
        );
        let rows = self.query(&sparql)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let uri = Self::binding_str(row, "concept").ok_or_else(|| {
                GraphStoreError::MalformedResponse("binding missing ?concept".to_string())
            })?;
            let id = Self::local_id(&uri);
            records.push(ConceptRecord {
                label: Self::binding_str(row, "label").unwrap_or_else(|| id.clone()),
                parent_id: Self::binding_str(row, "parent").map(|p| Self::local_id(&p)),
                description: Self::binding_str(row, "description").unwrap_or_default(),
                id,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, parent: Option<&str>) -> ConceptRecord {
        ConceptRecord {
            id: id.to_string(),
            label: id.to_string(),
            parent_id: parent.map(|p| p.to_string()),
            description: format!("about {}", id),
        }
    }

    #[test]
    fn memory_store_insert_exists_delete() {
        let store = MemoryGraphStore::new();
        assert!(!store.exists("Root").unwrap());

        store.insert_concept(&record("Root", None)).unwrap();
        assert!(store.exists("Root").unwrap());

        store.delete_concept("Root").unwrap();
        assert!(!store.exists("Root").unwrap());
    }

    #[test]
    fn memory_store_relations_are_symmetric_and_cleaned_up() {
        let store = MemoryGraphStore::new();
        store.insert_concept(&record("A", None)).unwrap();
        store.insert_concept(&record("B", Some("A"))).unwrap();
        store.add_relation("A", "B").unwrap();
        assert_eq!(store.relation_count(), 2);

        store.delete_concept("B").unwrap();
        assert_eq!(store.relation_count(), 0);
    }

    #[test]
    fn inventory_is_in_stable_id_order() {
        let store = MemoryGraphStore::seeded([
            record("Zeta", None),
            record("Alpha", Some("Zeta")),
        ]);
        let ids: Vec<String> = store
            .all_concepts()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["Alpha", "Zeta"]);
    }

    #[test]
    fn sparql_escape_handles_quotes_and_newlines() {
        assert_eq!(
            SparqlGraphStore::escape("a \"quoted\"\nline"),
            "a \\\"quoted\\\"\\nline"
        );
    }

    #[test]
    fn local_id_strips_uri_namespaces() {
        assert_eq!(
            SparqlGraphStore::local_id("http://example.org/ontology#VectorSearch"),
            "VectorSearch"
        );
        assert_eq!(SparqlGraphStore::local_id("plain"), "plain");
    }
}
