//! Staging Coordinator — the only writer of durable ontology state
//!
//! Commit takes a change set of reviewed mutations, snapshots all three
//! stores, orders additions parent-before-child, and applies them one at a
//! time; a mutation whose parent is missing is skipped and reported, never
//! fatal. Rollback restores the SQLite stores byte-for-byte from a backup
//! and diffs the graph back to the backed-up inventory.

use crate::candidate::{CandidateError, CandidateRepository};
use crate::embedding::{Embedder, EmbeddingError, EmbeddingStore, StoreError};
use crate::graph::{ConceptRecord, GraphStore, GraphStoreError, StagedConcept};
use crate::oracle::{call_with_retry, ConceptOracle, OracleError};
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

const VECTORS_FILE: &str = "vectors.db";
const CANDIDATES_FILE: &str = "candidates.db";
const INVENTORY_FILE: &str = "graph_inventory.json";

/// Errors from staging, commit, and rollback operations
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("vector store error: {0}")]
    Store(#[from] StoreError),

    #[error("candidate repository error: {0}")]
    Candidate(#[from] CandidateError),

    #[error("graph store error: {0}")]
    Graph(#[from] GraphStoreError),

    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no backups found in {0}")]
    NoBackups(PathBuf),

    #[error("backup not found: {0}")]
    BackupNotFound(String),
}

pub type StagingResult<T> = Result<T, StagingError>;

/// One reviewed mutation awaiting commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Add a concept class under its parent.
    AddClass(ConceptRecord),
    /// Add a symmetric "related" edge.
    AddRelation { a: String, b: String },
}

/// An ordered set of mutations to apply in one commit.
#[derive(Debug, Clone, Default)]
pub struct StagingChangeSet {
    pub mutations: Vec<Mutation>,
}

impl StagingChangeSet {
    pub fn new(mutations: Vec<Mutation>) -> Self {
        Self { mutations }
    }

    /// Build a change set from staged concepts: one class addition each,
    /// plus a "related" edge for every runner-up parent candidate.
    pub fn from_staged(staged: &[StagedConcept]) -> Self {
        let mut mutations = Vec::new();
        for concept in staged {
            mutations.push(Mutation::AddClass(ConceptRecord {
                id: concept.concept_id.clone(),
                label: concept.label.clone(),
                parent_id: Some(concept.parent_id.clone()),
                description: concept.description.clone(),
            }));
            for runner_up in concept.parent_candidates.iter().skip(1) {
                mutations.push(Mutation::AddRelation {
                    a: concept.concept_id.clone(),
                    b: runner_up.clone(),
                });
            }
        }
        Self { mutations }
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// A mutation the commit declined to apply, with the reason.
#[derive(Debug, Clone)]
pub struct SkippedMutation {
    pub concept_id: String,
    pub reason: String,
}

/// What one commit actually did.
#[derive(Debug, Clone)]
pub struct CommitReport {
    pub backup_name: String,
    pub applied: Vec<String>,
    pub relations_added: usize,
    pub skipped: Vec<SkippedMutation>,
}

/// A backup snapshot on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub name: String,
    pub path: PathBuf,
}

/// Coordinates staging, commit, and rollback across all three stores.
pub struct Coordinator {
    embeddings: Arc<EmbeddingStore>,
    candidates: Arc<CandidateRepository>,
    graph: Arc<dyn GraphStore>,
    backups_dir: PathBuf,
}

impl Coordinator {
    pub fn new(
        embeddings: Arc<EmbeddingStore>,
        candidates: Arc<CandidateRepository>,
        graph: Arc<dyn GraphStore>,
        backups_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            embeddings,
            candidates,
            graph,
            backups_dir: backups_dir.into(),
        }
    }

    // === Backups ===

    /// Snapshot all three stores into a new backup directory.
    ///
    /// SQLite stores are copied with the online backup API; the graph is
    /// captured as a full concept inventory dump.
    pub fn create_backup(&self) -> StagingResult<BackupInfo> {
        let seq = self
            .list_backups()?
            .first()
            .and_then(|b| b.name.split('_').nth(1))
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let name = format!("backup_{:04}_{}", seq, Utc::now().format("%Y%m%d%H%M%S"));
        let path = self.backups_dir.join(&name);
        std::fs::create_dir_all(&path)?;

        self.embeddings.backup_to(path.join(VECTORS_FILE))?;
        self.candidates.backup_to(path.join(CANDIDATES_FILE))?;
        let inventory = self.graph.all_concepts()?;
        std::fs::write(
            path.join(INVENTORY_FILE),
            serde_json::to_string_pretty(&inventory)?,
        )?;

        info!(backup = %name, concepts = inventory.len(), "created backup");
        Ok(BackupInfo { name, path })
    }

    /// All backups, newest first. Zero-padded sequence numbers keep the
    /// lexicographic order chronological.
    pub fn list_backups(&self) -> StagingResult<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        if !self.backups_dir.exists() {
            return Ok(backups);
        }
        for entry in std::fs::read_dir(&self.backups_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && name.starts_with("backup_") {
                backups.push(BackupInfo {
                    name,
                    path: entry.path(),
                });
            }
        }
        backups.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(backups)
    }

    /// Delete all but the newest `keep` backups.
    pub fn prune_backups(&self, keep: usize) -> StagingResult<usize> {
        let backups = self.list_backups()?;
        let mut removed = 0;
        for backup in backups.iter().skip(keep) {
            std::fs::remove_dir_all(&backup.path)?;
            removed += 1;
        }
        Ok(removed)
    }

    // === Commit ===

    /// Apply a change set to the durable stores.
    ///
    /// Takes a backup first, then applies class additions parent-before-
    /// child and relations last. A class whose parent exists in neither the
    /// durable graph nor the already-applied part of this commit is skipped
    /// and reported. When a class arrives without a description and an
    /// oracle is available, one is synthesized before insert.
    pub async fn commit(
        &self,
        change_set: &StagingChangeSet,
        embedder: &dyn Embedder,
        oracle: Option<&dyn ConceptOracle>,
    ) -> StagingResult<CommitReport> {
        let backup = self.create_backup()?;

        let mut classes: Vec<ConceptRecord> = Vec::new();
        let mut relations: Vec<(String, String)> = Vec::new();
        for mutation in &change_set.mutations {
            match mutation {
                Mutation::AddClass(record) => classes.push(record.clone()),
                Mutation::AddRelation { a, b } => relations.push((a.clone(), b.clone())),
            }
        }
        let classes = topological_order(classes);

        let mut applied: Vec<String> = Vec::new();
        let mut applied_set: HashSet<String> = HashSet::new();
        let mut skipped: Vec<SkippedMutation> = Vec::new();

        for mut record in classes {
            let parent_ok = match &record.parent_id {
                Some(parent) => applied_set.contains(parent) || self.graph.exists(parent)?,
                None => true,
            };
            if !parent_ok {
                let parent = record.parent_id.clone().unwrap_or_default();
                warn!(concept = %record.id, parent = %parent, "skipping class: parent not found");
                skipped.push(SkippedMutation {
                    concept_id: record.id,
                    reason: format!("parent '{}' not found", parent),
                });
                continue;
            }

            if record.description.is_empty() {
                if let Some(oracle) = oracle {
                    let timeout = std::time::Duration::from_secs(60);
                    let label = record.label.clone();
                    let described =
                        call_with_retry(timeout, || oracle.describe(&label, "")).await;
                    record.description = match described {
                        Ok(description) => description,
                        Err(e) => {
                            warn!(concept = %record.id, error = %e, "describe failed, using label");
                            label
                        }
                    };
                }
            }

            self.graph.insert_concept(&record)?;
            if !self.embeddings.set_staged(&record.id, false)? {
                let vector = embedder.embed(&record.description)?;
                self.embeddings
                    .upsert(&record.id, &record.description, vector, false)?;
            }
            applied_set.insert(record.id.clone());
            applied.push(record.id);
        }

        let mut relations_added = 0;
        for (a, b) in relations {
            let both_exist = (applied_set.contains(&a) || self.graph.exists(&a)?)
                && (applied_set.contains(&b) || self.graph.exists(&b)?);
            if both_exist {
                self.graph.add_relation(&a, &b)?;
                relations_added += 1;
            } else {
                warn!(%a, %b, "skipping relation: missing endpoint");
                skipped.push(SkippedMutation {
                    concept_id: a,
                    reason: format!("relation endpoint '{}' not found", b),
                });
            }
        }

        info!(
            backup = %backup.name,
            applied = applied.len(),
            relations = relations_added,
            skipped = skipped.len(),
            "commit complete"
        );
        Ok(CommitReport {
            backup_name: backup.name,
            applied,
            relations_added,
            skipped,
        })
    }

    // === Rollback ===

    /// Restore all three stores to a backup snapshot. With no name given,
    /// the newest backup is used.
    ///
    /// SQLite stores come back byte-for-byte; the graph is diffed against
    /// the backed-up inventory, deleting concepts added since and
    /// re-inserting any that were removed.
    pub fn rollback(&self, backup_name: Option<&str>) -> StagingResult<BackupInfo> {
        let backups = self.list_backups()?;
        let backup = match backup_name {
            Some(name) => backups
                .into_iter()
                .find(|b| b.name == name)
                .ok_or_else(|| StagingError::BackupNotFound(name.to_string()))?,
            None => backups
                .into_iter()
                .next()
                .ok_or_else(|| StagingError::NoBackups(self.backups_dir.clone()))?,
        };

        self.embeddings.restore_from(backup.path.join(VECTORS_FILE))?;
        self.candidates
            .restore_from(backup.path.join(CANDIDATES_FILE))?;

        let raw = std::fs::read_to_string(backup.path.join(INVENTORY_FILE))?;
        let saved: Vec<ConceptRecord> = serde_json::from_str(&raw)?;
        let saved_ids: HashSet<&str> = saved.iter().map(|r| r.id.as_str()).collect();

        let current = self.graph.all_concepts()?;
        let current_ids: HashSet<&str> = current.iter().map(|r| r.id.as_str()).collect();

        let mut deleted = 0;
        for record in &current {
            if !saved_ids.contains(record.id.as_str()) {
                self.graph.delete_concept(&record.id)?;
                deleted += 1;
            }
        }
        let mut restored = 0;
        for record in &saved {
            if !current_ids.contains(record.id.as_str()) {
                self.graph.insert_concept(record)?;
                restored += 1;
            }
        }

        info!(backup = %backup.name, deleted, restored, "rollback complete");
        Ok(backup)
    }
}

/// Order class additions so every in-set parent precedes its children.
/// Stable for inputs already in order; classes with out-of-set parents keep
/// their relative position at the front of each pass.
fn topological_order(classes: Vec<ConceptRecord>) -> Vec<ConceptRecord> {
    let in_set: HashSet<String> = classes.iter().map(|r| r.id.clone()).collect();
    let mut pending = classes;
    let mut ordered: Vec<ConceptRecord> = Vec::with_capacity(pending.len());
    let mut emitted: HashSet<String> = HashSet::new();

    while !pending.is_empty() {
        let mut progressed = false;
        let mut remaining = Vec::new();
        for record in pending {
            let ready = match &record.parent_id {
                Some(parent) => !in_set.contains(parent) || emitted.contains(parent),
                None => true,
            };
            if ready {
                emitted.insert(record.id.clone());
                ordered.push(record);
                progressed = true;
            } else {
                remaining.push(record);
            }
        }
        if !progressed {
            // Cycle; emit the rest as-is and let the parent-exists gate
            // report them.
            ordered.extend(remaining);
            break;
        }
        pending = remaining;
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::StubEmbedder;
    use crate::graph::MemoryGraphStore;
    use std::path::Path;

    fn record(id: &str, parent: Option<&str>) -> ConceptRecord {
        ConceptRecord {
            id: id.to_string(),
            label: id.to_string(),
            parent_id: parent.map(|p| p.to_string()),
            description: format!("about {}", id),
        }
    }

    fn coordinator(dir: &Path) -> (Coordinator, Arc<MemoryGraphStore>) {
        let graph = Arc::new(MemoryGraphStore::seeded([record("Root", None)]));
        let coordinator = Coordinator::new(
            Arc::new(EmbeddingStore::open(dir.join("vectors.db")).unwrap()),
            Arc::new(CandidateRepository::open(dir.join("candidates.db")).unwrap()),
            graph.clone(),
            dir.join("backups"),
        );
        (coordinator, graph)
    }

    #[tokio::test]
    async fn commit_applies_parent_before_child() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, graph) = coordinator(dir.path());

        // Child listed before its parent; ordering must fix it.
        let change_set = StagingChangeSet::new(vec![
            Mutation::AddClass(record("Child", Some("Parent"))),
            Mutation::AddClass(record("Parent", Some("Root"))),
        ]);
        let report = coordinator
            .commit(&change_set, &StubEmbedder::new(4), None)
            .await
            .unwrap();

        assert_eq!(report.applied, vec!["Parent", "Child"]);
        assert!(report.skipped.is_empty());
        assert!(graph.exists("Child").unwrap());
    }

    #[tokio::test]
    async fn class_with_absent_parent_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, graph) = coordinator(dir.path());

        let change_set = StagingChangeSet::new(vec![
            Mutation::AddClass(record("Orphan", Some("Nowhere"))),
            Mutation::AddClass(record("Fine", Some("Root"))),
        ]);
        let report = coordinator
            .commit(&change_set, &StubEmbedder::new(4), None)
            .await
            .unwrap();

        assert_eq!(report.applied, vec!["Fine"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].concept_id, "Orphan");
        assert!(!graph.exists("Orphan").unwrap());
    }

    #[tokio::test]
    async fn commit_promotes_staged_vector_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path());
        coordinator
            .embeddings
            .upsert("Fine", "about Fine", vec![1.0, 0.0], true)
            .unwrap();

        let change_set =
            StagingChangeSet::new(vec![Mutation::AddClass(record("Fine", Some("Root")))]);
        coordinator
            .commit(&change_set, &StubEmbedder::new(2), None)
            .await
            .unwrap();

        assert_eq!(coordinator.embeddings.count(false).unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_description_is_synthesized_and_falls_back_to_label() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path());
        let oracle = crate::oracle::MockOracle::new();

        let mut described = record("Fine", Some("Root"));
        described.description = String::new();
        coordinator
            .commit(
                &StagingChangeSet::new(vec![Mutation::AddClass(described)]),
                &StubEmbedder::new(4),
                Some(&oracle),
            )
            .await
            .unwrap();
        assert_eq!(
            coordinator.embeddings.description("Fine").unwrap().as_deref(),
            Some("Fine is a concept in this ontology.")
        );

        oracle.set_failing(true);
        let mut bare = record("Bare", Some("Root"));
        bare.description = String::new();
        coordinator
            .commit(
                &StagingChangeSet::new(vec![Mutation::AddClass(bare)]),
                &StubEmbedder::new(4),
                Some(&oracle),
            )
            .await
            .unwrap();
        assert_eq!(
            coordinator.embeddings.description("Bare").unwrap().as_deref(),
            Some("Bare")
        );
    }

    #[tokio::test]
    async fn rollback_restores_graph_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, graph) = coordinator(dir.path());
        let before = graph.all_concepts().unwrap();

        let change_set = StagingChangeSet::new(vec![
            Mutation::AddClass(record("A", Some("Root"))),
            Mutation::AddClass(record("B", Some("A"))),
        ]);
        coordinator
            .commit(&change_set, &StubEmbedder::new(4), None)
            .await
            .unwrap();
        assert_eq!(graph.all_concepts().unwrap().len(), 3);

        coordinator.rollback(None).unwrap();
        assert_eq!(graph.all_concepts().unwrap(), before);
    }

    #[tokio::test]
    async fn relations_with_missing_endpoints_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, graph) = coordinator(dir.path());

        let change_set = StagingChangeSet::new(vec![
            Mutation::AddClass(record("A", Some("Root"))),
            Mutation::AddRelation {
                a: "A".to_string(),
                b: "Missing".to_string(),
            },
        ]);
        let report = coordinator
            .commit(&change_set, &StubEmbedder::new(4), None)
            .await
            .unwrap();

        assert_eq!(report.relations_added, 0);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(graph.relation_count(), 0);
    }

    #[test]
    fn backups_list_newest_first_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path());

        let first = coordinator.create_backup().unwrap();
        let second = coordinator.create_backup().unwrap();
        let listed = coordinator.list_backups().unwrap();
        assert_eq!(listed[0].name, second.name);
        assert_eq!(listed[1].name, first.name);

        let removed = coordinator.prune_backups(1).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(coordinator.list_backups().unwrap().len(), 1);
    }
}
