//! OntologyGraphManager — committed and staged views of the ontology
//!
//! Mirrors the committed ontology in memory and overlays staged (pending,
//! not-yet-durable) additions. All ancestry queries used during a batch run
//! read the staged view so earlier staged additions are visible to later
//! decisions. The committed view is only mutated by the Coordinator, during
//! a Commit.

use super::store::{ConceptRecord, GraphResult, GraphStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Which graph view a query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    /// Durable state only.
    Committed,
    /// Durable state plus pending staged additions.
    Staged,
}

/// A pending ontology addition, visible in the staged view only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedConcept {
    pub concept_id: String,
    pub label: String,
    pub description: String,
    pub parent_id: String,
    /// Every observed keyword this concept absorbs.
    pub original_keywords: Vec<String>,
    /// Ranked parent candidates proposed at promotion time (best first).
    pub parent_candidates: Vec<String>,
    /// Oracle rationale for the parent assignment.
    pub parent_reason: String,
}

/// In-memory mirror of the ontology with a staged overlay.
pub struct OntologyGraphManager {
    root: String,
    committed: BTreeMap<String, ConceptRecord>,
    staged: Vec<StagedConcept>,
}

impl OntologyGraphManager {
    /// Build the committed view from a full store inventory.
    pub fn load(store: &dyn GraphStore, root: impl Into<String>) -> GraphResult<Self> {
        let records = store.all_concepts()?;
        Ok(Self::from_records(records, root))
    }

    pub fn from_records(
        records: impl IntoIterator<Item = ConceptRecord>,
        root: impl Into<String>,
    ) -> Self {
        let committed = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self {
            root: root.into(),
            committed,
            staged: Vec::new(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn contains(&self, concept_id: &str, view: View) -> bool {
        if self.committed.contains_key(concept_id) {
            return true;
        }
        view == View::Staged && self.staged.iter().any(|s| s.concept_id == concept_id)
    }

    /// Primary parent of a concept in the given view.
    pub fn parent_of(&self, concept_id: &str, view: View) -> Option<&str> {
        if let Some(record) = self.committed.get(concept_id) {
            return record.parent_id.as_deref();
        }
        if view == View::Staged {
            return self
                .staged
                .iter()
                .find(|s| s.concept_id == concept_id)
                .map(|s| s.parent_id.as_str());
        }
        None
    }

    /// Direct children of a concept in the given view.
    pub fn children_of(&self, concept_id: &str, view: View) -> Vec<String> {
        let mut children: Vec<String> = self
            .committed
            .values()
            .filter(|r| r.parent_id.as_deref() == Some(concept_id))
            .map(|r| r.id.clone())
            .collect();
        if view == View::Staged {
            children.extend(
                self.staged
                    .iter()
                    .filter(|s| s.parent_id == concept_id)
                    .map(|s| s.concept_id.clone()),
            );
        }
        children
    }

    /// Direct children of the configured root.
    pub fn root_children(&self, view: View) -> Vec<String> {
        self.children_of(&self.root, view)
    }

    /// The near-root exclusion set: the root and its direct children in the
    /// staged view. Overly generic categories must never win a vector match.
    pub fn exclusion_set(&self) -> HashSet<String> {
        let mut set: HashSet<String> = self.root_children(View::Staged).into_iter().collect();
        set.insert(self.root.clone());
        set
    }

    /// Path from a concept up to the root (inclusive on both ends).
    ///
    /// Stops early on a dangling parent; a cycle guard caps the walk at the
    /// total concept count.
    pub fn path_to_root(&self, concept_id: &str, view: View) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = concept_id.to_string();
        let cap = self.committed.len() + self.staged.len() + 1;
        while path.len() <= cap {
            path.push(current.clone());
            if current == self.root {
                break;
            }
            match self.parent_of(&current, view) {
                Some(parent) => current = parent.to_string(),
                None => break,
            }
        }
        path
    }

    /// All transitive descendants of a concept in the given view.
    pub fn descendants(&self, concept_id: &str, view: View) -> Vec<String> {
        let mut out = Vec::new();
        let mut frontier = self.children_of(concept_id, view);
        while let Some(next) = frontier.pop() {
            frontier.extend(self.children_of(&next, view));
            out.push(next);
        }
        out
    }

    // === Staged overlay ===

    /// Append a staged addition. The committed view is untouched.
    pub fn stage(&mut self, concept: StagedConcept) {
        self.staged.push(concept);
    }

    pub fn staged_concepts(&self) -> &[StagedConcept] {
        &self.staged
    }

    /// Restore a staged overlay snapshot (checkpoint resume).
    pub fn set_staged(&mut self, staged: Vec<StagedConcept>) {
        self.staged = staged;
    }

    /// Attach an observed keyword to an already-staged concept. Returns
    /// false when the concept is not in the staged overlay.
    pub fn backfill_keyword(&mut self, concept_id: &str, keyword: &str) -> bool {
        match self.staged.iter_mut().find(|s| s.concept_id == concept_id) {
            Some(concept) => {
                if !concept.original_keywords.iter().any(|k| k == keyword) {
                    concept.original_keywords.push(keyword.to_string());
                }
                true
            }
            None => false,
        }
    }

    pub fn clear_staged(&mut self) {
        self.staged.clear();
    }

    /// Record a concept as durably committed. Removes any matching staged
    /// entry. Called only by the Coordinator during Commit.
    pub fn mark_committed(&mut self, record: ConceptRecord) {
        self.staged.retain(|s| s.concept_id != record.id);
        self.committed.insert(record.id.clone(), record);
    }

    pub fn committed_count(&self) -> usize {
        self.committed.len()
    }
}
