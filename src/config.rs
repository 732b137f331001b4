//! Consolidation engine configuration
//!
//! All tunables in one place so a batch run can persist the exact settings
//! it was started with alongside its artifacts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a consolidation run.
///
/// Defaults mirror the behavior the engine is calibrated for: DBSCAN at
/// ε = 0.25 with 3 minimum neighbors, re-splitting oversized clusters at a
/// tighter ε = 0.15, and promoting clusters only once they hold 5 members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Root concept id of the ontology. The root and its direct children
    /// form the near-root exclusion set for vector search.
    pub root_concept: String,

    /// DBSCAN neighborhood radius (cosine distance).
    pub cluster_epsilon: f32,
    /// DBSCAN minimum neighbor count for a core point.
    pub cluster_min_neighbors: usize,
    /// Tighter radius used when re-splitting oversized clusters.
    pub resplit_epsilon: f32,
    /// Clusters larger than this are recursively re-split.
    pub max_cluster_size: usize,
    /// Minimum cluster size for promotion eligibility.
    pub min_promotable_size: usize,
    /// Recluster once this many new candidates accumulated since the last run.
    pub recluster_every: usize,

    /// Nearest-neighbor count per noun-phrase search.
    pub search_k: usize,
    /// Maximum noun phrases extracted per observed keyword.
    pub max_noun_phrases: usize,
    /// Maximum distinct matched concept ids kept per input item.
    pub max_matched_ids: usize,

    /// Checkpoint cadence in processed items.
    pub checkpoint_interval: usize,
    /// Timeout applied to every Oracle call.
    pub oracle_timeout: Duration,

    /// Promote every eligible cluster found in one state-machine invocation
    /// instead of only the first. Off by default.
    pub promote_all_eligible: bool,
    /// During the rematch pass, fall back to the nearest search candidate
    /// when the Oracle declines to match. Off by default.
    pub force_nearest_rematch: bool,
    /// Run the rematch pass at the end of a batch.
    pub rematch_after_batch: bool,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            root_concept: "Root".to_string(),
            cluster_epsilon: 0.25,
            cluster_min_neighbors: 3,
            resplit_epsilon: 0.15,
            max_cluster_size: 10,
            min_promotable_size: 5,
            recluster_every: 3,
            search_k: 5,
            max_noun_phrases: 3,
            max_matched_ids: 3,
            checkpoint_interval: 10,
            oracle_timeout: Duration::from_secs(60),
            promote_all_eligible: false,
            force_nearest_rematch: false,
            rematch_after_batch: true,
        }
    }
}

impl ConsolidationConfig {
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root_concept = root.into();
        self
    }
}
