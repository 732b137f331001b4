//! End-of-batch rematch pass
//!
//! Concepts promoted late in a batch were invisible to items processed
//! early, so their duplicates may still sit in the candidate repository.
//! This pass re-runs search and match judgment for every remaining
//! candidate against the now-complete staged view, absorbing the ones that
//! match and reclustering whatever is left.

use super::matcher::{validated_match, ConceptMatcher};
use super::PipelineResult;
use crate::graph::OntologyGraphManager;
use crate::oracle::call_with_retry;
use tracing::{debug, info};

/// What the rematch pass resolved.
#[derive(Debug, Clone, Default)]
pub struct RematchReport {
    /// (candidate concept text, concept it was absorbed into)
    pub rematched: Vec<(String, String)>,
    /// Candidates still unmatched after the pass.
    pub remaining: usize,
}

impl ConceptMatcher {
    /// Re-judge every remaining candidate against the staged view.
    ///
    /// With `force_nearest_rematch` set, a candidate the Oracle declines to
    /// match is still absorbed into its nearest search hit.
    pub async fn rematch_pass(
        &self,
        manager: &mut OntologyGraphManager,
    ) -> PipelineResult<RematchReport> {
        let timeout = self.config().oracle_timeout;
        let mut rematched: Vec<(String, String)> = Vec::new();

        for candidate in self.candidates().all()? {
            let exclusion = manager.exclusion_set();
            let hits = self.embeddings().search(
                &candidate.embedding,
                self.config().search_k,
                &exclusion,
                true,
            )?;
            let judgment = call_with_retry(timeout, || {
                self.oracle()
                    .judge_match(&candidate.concept_text, &candidate.description, &hits)
            })
            .await?;

            let matched = validated_match(&judgment.matched_id, &hits).or_else(|| {
                if self.config().force_nearest_rematch {
                    hits.first().map(|h| h.concept_id.clone())
                } else {
                    None
                }
            });

            match matched {
                Some(concept_id) => {
                    debug!(
                        candidate = %candidate.concept_text,
                        concept = %concept_id,
                        "rematched candidate"
                    );
                    manager.backfill_keyword(&concept_id, &candidate.original_keyword);
                    self.candidates().remove(candidate.id)?;
                    rematched.push((candidate.concept_text, concept_id));
                }
                None => {
                    debug!(candidate = %candidate.concept_text, "still unmatched");
                }
            }
        }

        // Membership changed; stale cluster rows must not survive.
        if !rematched.is_empty() {
            self.cluster_engine().recluster(self.candidates())?;
            self.candidates().mark_reclustered()?;
        }

        let remaining = self.candidates().count()?;
        info!(rematched = rematched.len(), remaining, "rematch pass complete");
        Ok(RematchReport { rematched, remaining })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::cluster::{ClusterEngine, ClusterParams};
    use crate::candidate::{CandidateRepository, NewCandidate};
    use crate::config::ConsolidationConfig;
    use crate::embedding::{EmbeddingStore, StubEmbedder};
    use crate::graph::{ConceptRecord, StagedConcept};
    use crate::oracle::MockOracle;
    use std::sync::Arc;

    fn manager() -> OntologyGraphManager {
        OntologyGraphManager::from_records(
            [ConceptRecord {
                id: "Root".into(),
                label: "Root".into(),
                parent_id: None,
                description: String::new(),
            }],
            "Root",
        )
    }

    fn matcher(oracle: MockOracle, config: ConsolidationConfig) -> ConceptMatcher {
        ConceptMatcher::new(
            Arc::new(EmbeddingStore::open_in_memory().unwrap()),
            Arc::new(CandidateRepository::open_in_memory().unwrap()),
            ClusterEngine::new(ClusterParams::default()),
            Arc::new(StubEmbedder::new(8)),
            Arc::new(oracle),
            config,
        )
    }

    fn candidate(text: &str, embedding: Vec<f32>) -> NewCandidate {
        NewCandidate {
            concept_text: text.to_string(),
            description: format!("about {}", text),
            embedding,
            source: "sec_1".to_string(),
            original_keyword: text.to_string(),
            noun_phrase_summary: text.to_string(),
            oracle_reason: "no match at the time".to_string(),
        }
    }

    #[tokio::test]
    async fn rematch_absorbs_candidate_into_staged_concept() {
        let oracle = MockOracle::new().with_match("ssm variant", "StateSpace", "same family");
        let m = matcher(oracle, ConsolidationConfig::default());
        let mut mgr = manager();

        // A concept promoted late in the batch, visible only now.
        m.embeddings()
            .upsert("StateSpace", "state space models", vec![1.0; 8], true)
            .unwrap();
        mgr.stage(StagedConcept {
            concept_id: "StateSpace".into(),
            label: "StateSpace".into(),
            description: "state space models".into(),
            parent_id: "Root".into(),
            original_keywords: vec!["state space".into()],
            parent_candidates: vec!["Root".into()],
            parent_reason: String::new(),
        });
        m.candidates()
            .save(&candidate("ssm variant", vec![1.0; 8]))
            .unwrap();

        let report = m.rematch_pass(&mut mgr).await.unwrap();
        assert_eq!(
            report.rematched,
            vec![("ssm variant".to_string(), "StateSpace".to_string())]
        );
        assert_eq!(report.remaining, 0);
        assert_eq!(m.candidates().count().unwrap(), 0);
        assert!(mgr.staged_concepts()[0]
            .original_keywords
            .contains(&"ssm variant".to_string()));
    }

    #[tokio::test]
    async fn declined_match_stays_unless_nearest_is_forced() {
        let mut config = ConsolidationConfig::default();
        config.force_nearest_rematch = false;
        let m = matcher(MockOracle::new(), config);
        let mut mgr = manager();

        m.embeddings()
            .upsert("Near", "the nearest concept", vec![1.0; 8], false)
            .unwrap();
        m.candidates()
            .save(&candidate("stray", vec![1.0; 8]))
            .unwrap();

        let report = m.rematch_pass(&mut mgr).await.unwrap();
        assert!(report.rematched.is_empty());
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn forced_nearest_absorbs_declined_candidates() {
        let mut config = ConsolidationConfig::default();
        config.force_nearest_rematch = true;
        let m = matcher(MockOracle::new(), config);
        let mut mgr = manager();

        m.embeddings()
            .upsert("Near", "the nearest concept", vec![1.0; 8], false)
            .unwrap();
        m.candidates()
            .save(&candidate("stray", vec![1.0; 8]))
            .unwrap();

        let report = m.rematch_pass(&mut mgr).await.unwrap();
        assert_eq!(
            report.rematched,
            vec![("stray".to_string(), "Near".to_string())]
        );
        assert_eq!(m.candidates().count().unwrap(), 0);
    }
}
