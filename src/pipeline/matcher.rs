//! The per-item matching state machine
//!
//! EXTRACTING → SEARCHING → MATCHING → (SAVING_NEW → CHECKING_CLUSTER →
//! PROMOTING) per noun phrase. "No match" and "cluster not promotable" are
//! ordinary outcomes; only infrastructure failures return Err. A promotion
//! whose top-ranked parent is absent from the staged view aborts with no
//! side effects at all.

use super::{BatchItem, PipelineResult};
use crate::candidate::cluster::ClusterEngine;
use crate::candidate::{CandidateRepository, Cluster, NewCandidate};
use crate::config::ConsolidationConfig;
use crate::embedding::{Embedder, EmbeddingStore, ScoredConcept};
use crate::graph::{OntologyGraphManager, StagedConcept, View};
use crate::oracle::{call_with_retry, ConceptOracle};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// State-machine phases, used for trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    Extracting,
    Searching,
    Matching,
    SavingNew,
    CheckingCluster,
    Promoting,
}

/// What processing one input item produced.
#[derive(Debug, Clone, Default)]
pub struct ItemOutcome {
    pub noun_phrases: Vec<String>,
    /// Distinct existing or newly promoted concepts this item mapped to.
    pub matched_ids: Vec<String>,
    /// Noun phrases stored as new candidates.
    pub saved_phrases: Vec<String>,
    /// Concepts promoted out of clusters while processing this item.
    pub promoted: Vec<String>,
}

/// Runs one input item through the matching state machine.
pub struct ConceptMatcher {
    embeddings: Arc<EmbeddingStore>,
    candidates: Arc<CandidateRepository>,
    cluster_engine: ClusterEngine,
    embedder: Arc<dyn Embedder>,
    oracle: Arc<dyn ConceptOracle>,
    config: ConsolidationConfig,
}

impl ConceptMatcher {
    pub fn new(
        embeddings: Arc<EmbeddingStore>,
        candidates: Arc<CandidateRepository>,
        cluster_engine: ClusterEngine,
        embedder: Arc<dyn Embedder>,
        oracle: Arc<dyn ConceptOracle>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            embeddings,
            candidates,
            cluster_engine,
            embedder,
            oracle,
            config,
        }
    }

    pub(super) fn embeddings(&self) -> &EmbeddingStore {
        &self.embeddings
    }

    pub(super) fn candidates(&self) -> &CandidateRepository {
        &self.candidates
    }

    pub(super) fn cluster_engine(&self) -> &ClusterEngine {
        &self.cluster_engine
    }

    pub(super) fn oracle(&self) -> &dyn ConceptOracle {
        self.oracle.as_ref()
    }

    pub(super) fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Process one input item against the staged view of the ontology.
    pub async fn process_item(
        &self,
        manager: &mut OntologyGraphManager,
        item: &BatchItem,
    ) -> PipelineResult<ItemOutcome> {
        let context = item.context();
        let timeout = self.config.oracle_timeout;

        debug!(phase = ?MatchPhase::Extracting, keyword = %item.concept, "extracting noun phrases");
        let top_level = manager.root_children(View::Staged);
        let mut phrases = call_with_retry(timeout, || {
            self.oracle
                .extract_noun_phrases(&item.concept, &context, &top_level)
        })
        .await?;
        phrases.truncate(self.config.max_noun_phrases);

        let mut outcome = ItemOutcome {
            noun_phrases: phrases.clone(),
            ..Default::default()
        };

        for phrase in &phrases {
            let exclusion = manager.exclusion_set();
            debug!(phase = ?MatchPhase::Searching, %phrase, "searching nearest concepts");
            let query = self.embedder.embed(phrase)?;
            let hits =
                self.embeddings
                    .search(&query, self.config.search_k, &exclusion, true)?;

            debug!(phase = ?MatchPhase::Matching, %phrase, candidates = hits.len());
            let judgment = call_with_retry(timeout, || {
                self.oracle.judge_match(phrase, &context, &hits)
            })
            .await?;

            match validated_match(&judgment.matched_id, &hits) {
                Some(matched_id) => {
                    info!(%phrase, concept = %matched_id, "matched existing concept");
                    manager.backfill_keyword(&matched_id, &item.concept);
                    self.record_match(&mut outcome, matched_id);
                }
                None => {
                    debug!(phase = ?MatchPhase::SavingNew, %phrase, reason = %judgment.reason);
                    let description = call_with_retry(timeout, || {
                        self.oracle.describe(phrase, &context)
                    })
                    .await?;
                    self.candidates.save(&NewCandidate {
                        concept_text: phrase.clone(),
                        description,
                        embedding: query.clone(),
                        source: item.section_id.clone(),
                        original_keyword: item.concept.clone(),
                        noun_phrase_summary: judgment.noun_phrase_summary.clone(),
                        oracle_reason: judgment.reason.clone(),
                    })?;
                    outcome.saved_phrases.push(phrase.clone());

                    let promoted = self.check_and_promote(manager, phrase).await?;
                    for concept_id in promoted {
                        outcome.promoted.push(concept_id.clone());
                        self.record_match(&mut outcome, concept_id);
                    }
                }
            }
        }

        Ok(outcome)
    }

    fn record_match(&self, outcome: &mut ItemOutcome, concept_id: String) {
        if outcome.matched_ids.len() < self.config.max_matched_ids
            && !outcome.matched_ids.contains(&concept_id)
        {
            outcome.matched_ids.push(concept_id);
        }
    }

    /// CHECKING_CLUSTER and PROMOTING: recluster if due, then try to promote
    /// either the cluster containing `phrase` or every eligible cluster.
    async fn check_and_promote(
        &self,
        manager: &mut OntologyGraphManager,
        phrase: &str,
    ) -> PipelineResult<Vec<String>> {
        debug!(phase = ?MatchPhase::CheckingCluster, %phrase);
        if self.candidates.due_for_recluster(self.config.recluster_every)? {
            self.cluster_engine.recluster(&self.candidates)?;
            self.candidates.mark_reclustered()?;
        }

        let eligible = if self.config.promote_all_eligible {
            self.candidates
                .clusters(self.config.min_promotable_size, None)?
        } else {
            self.candidates
                .clusters(self.config.min_promotable_size, Some(phrase))?
        };

        let mut promoted = Vec::new();
        for cluster in eligible {
            if let Some(concept_id) = self.promote_cluster(manager, &cluster).await? {
                promoted.push(concept_id);
            }
            if !self.config.promote_all_eligible && !promoted.is_empty() {
                break;
            }
        }
        Ok(promoted)
    }

    /// Promote one cluster into a staged concept, or decline. Declines are
    /// side-effect free: the cluster and its candidates stay untouched.
    async fn promote_cluster(
        &self,
        manager: &mut OntologyGraphManager,
        cluster: &Cluster,
    ) -> PipelineResult<Option<String>> {
        let timeout = self.config.oracle_timeout;
        debug!(phase = ?MatchPhase::Promoting, cluster = %cluster.name, size = cluster.len());

        let validation = call_with_retry(timeout, || {
            self.oracle.validate_cluster(&cluster.members)
        })
        .await?;
        if !validation.can_merge {
            debug!(cluster = %cluster.name, reason = %validation.reason, "cluster rejected");
            return Ok(None);
        }

        let concept_id = concept_id_from(&validation.representative_key);
        let keywords: Vec<String> = {
            let mut seen = Vec::new();
            for member in &cluster.members {
                if !seen.contains(&member.original_keyword) {
                    seen.push(member.original_keyword.clone());
                }
            }
            seen
        };

        if manager.contains(&concept_id, View::Staged) {
            // Concept already exists; absorb the cluster into it.
            for keyword in &keywords {
                manager.backfill_keyword(&concept_id, keyword);
            }
            self.candidates.remove_cluster(cluster.id)?;
            info!(concept = %concept_id, "cluster absorbed into existing concept");
            return Ok(Some(concept_id));
        }

        let parents = call_with_retry(timeout, || {
            self.oracle
                .propose_parents(&concept_id, &validation.unified_description)
        })
        .await?;
        let Some(top) = parents.first() else {
            warn!(concept = %concept_id, "promotion aborted: no parent proposed");
            return Ok(None);
        };
        if !manager.contains(&top.parent_id, View::Staged) {
            warn!(
                concept = %concept_id,
                parent = %top.parent_id,
                "promotion aborted: proposed parent not in ontology"
            );
            return Ok(None);
        }

        let parent_candidates: Vec<String> = parents
            .iter()
            .take(self.config.max_matched_ids)
            .map(|p| p.parent_id.clone())
            .collect();
        let embedding = self.embedder.embed(&validation.unified_description)?;
        self.embeddings.upsert(
            &concept_id,
            &validation.unified_description,
            embedding,
            true,
        )?;
        manager.stage(StagedConcept {
            concept_id: concept_id.clone(),
            label: validation.representative_key.clone(),
            description: validation.unified_description.clone(),
            parent_id: top.parent_id.clone(),
            original_keywords: keywords,
            parent_candidates,
            parent_reason: validation.reason.clone(),
        });
        self.candidates.remove_cluster(cluster.id)?;

        info!(
            concept = %concept_id,
            parent = %top.parent_id,
            members = cluster.len(),
            "promoted cluster to staged concept"
        );
        Ok(Some(concept_id))
    }
}

/// A matched id is only accepted when it names one of the search hits;
/// anything else is treated as no match.
pub(super) fn validated_match(matched_id: &Option<String>, hits: &[ScoredConcept]) -> Option<String> {
    let id = matched_id.as_ref()?;
    if hits.iter().any(|h| &h.concept_id == id) {
        Some(id.clone())
    } else {
        warn!(concept = %id, "oracle matched a concept outside the candidate list; ignoring");
        None
    }
}

/// Derive a graph-safe concept id from a representative key.
fn concept_id_from(key: &str) -> String {
    let id: String = key
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let id = id.trim_matches('_').to_string();
    if id.is_empty() {
        format!("concept_{}", Uuid::new_v4().simple())
    } else {
        id
    }
}
