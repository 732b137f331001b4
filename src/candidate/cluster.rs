//! ClusterEngine — density-based grouping of candidate concepts
//!
//! Builds a pairwise cosine-distance matrix over all candidates, forces
//! distance 0 between identical concept texts (same-name observations always
//! merge regardless of embedding noise), then runs DBSCAN. Oversized
//! clusters are recursively re-split with a tighter radius; fragments below
//! two members are discarded. Every pass fully replaces the stored cluster
//! rows — clustering is idempotent-from-scratch, never diffed.

use super::{Candidate, CandidateRepository, CandidateResult};
use crate::embedding::cosine_distance;
use tracing::{debug, info};

/// DBSCAN label for points not assigned to any cluster.
const NOISE: i64 = -1;
const UNVISITED: i64 = -2;

/// Tunables for one clustering pass.
#[derive(Debug, Clone)]
pub struct ClusterParams {
    /// Neighborhood radius (cosine distance).
    pub epsilon: f32,
    /// Minimum neighbor count (self included) for a core point.
    pub min_neighbors: usize,
    /// Radius for re-splitting oversized clusters.
    pub resplit_epsilon: f32,
    /// Clusters larger than this are re-split.
    pub max_cluster_size: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            epsilon: 0.25,
            min_neighbors: 3,
            resplit_epsilon: 0.15,
            max_cluster_size: 10,
        }
    }
}

/// Outcome of a clustering pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclusterSummary {
    pub candidates_considered: usize,
    pub clusters_stored: usize,
}

/// Groups unmatched candidates into coherent duplicate groups.
pub struct ClusterEngine {
    params: ClusterParams,
}

impl ClusterEngine {
    pub fn new(params: ClusterParams) -> Self {
        Self { params }
    }

    /// Recompute all clusters from the current repository contents and
    /// replace the stored cluster rows. Idempotent for unchanged input.
    pub fn recluster(&self, repo: &CandidateRepository) -> CandidateResult<ReclusterSummary> {
        let candidates = repo.all()?;
        if candidates.len() < 2 {
            debug!(count = candidates.len(), "too few candidates to cluster");
            return Ok(ReclusterSummary {
                candidates_considered: candidates.len(),
                clusters_stored: 0,
            });
        }

        let matrix = distance_matrix(&candidates);
        let labels = dbscan(&matrix, self.params.epsilon, self.params.min_neighbors);

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let max_label = labels.iter().copied().max().unwrap_or(NOISE);
        for label in 0..=max_label {
            if label < 0 {
                continue;
            }
            let group: Vec<usize> = (0..candidates.len())
                .filter(|&i| labels[i] == label)
                .collect();
            if group.len() >= 2 {
                groups.push(group);
            }
        }

        // Re-split anything over the size bound with a tighter radius.
        let mut bounded: Vec<Vec<usize>> = Vec::new();
        for group in groups {
            if group.len() > self.params.max_cluster_size {
                self.resplit(&matrix, group, self.params.resplit_epsilon, &mut bounded);
            } else {
                bounded.push(group);
            }
        }

        let member_groups: Vec<Vec<String>> = bounded
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|&i| candidates[i].concept_text.clone())
                    .collect()
            })
            .collect();

        let stored = repo.replace_clusters(&member_groups)?;
        info!(
            candidates = candidates.len(),
            clusters = stored,
            "clustering pass complete"
        );
        Ok(ReclusterSummary {
            candidates_considered: candidates.len(),
            clusters_stored: stored,
        })
    }

    /// Recursively split an oversized group until every surviving fragment
    /// is within bounds. Fragments smaller than 2 are dropped; a group that
    /// will not separate even at the radius floor is dropped as impure.
    fn resplit(
        &self,
        matrix: &[Vec<f32>],
        group: Vec<usize>,
        epsilon: f32,
        out: &mut Vec<Vec<usize>>,
    ) {
        const EPSILON_FLOOR: f32 = 0.01;

        let sub = submatrix(matrix, &group);
        let labels = dbscan(&sub, epsilon, 2);

        let max_label = labels.iter().copied().max().unwrap_or(NOISE);
        for label in 0..=max_label {
            if label < 0 {
                continue;
            }
            let fragment: Vec<usize> = (0..group.len())
                .filter(|&i| labels[i] == label)
                .map(|i| group[i])
                .collect();
            if fragment.len() < 2 {
                continue;
            }
            if fragment.len() > self.params.max_cluster_size {
                if fragment.len() == group.len() {
                    // No separation happened at this radius; tighten or give up.
                    let tighter = epsilon * 0.6;
                    if tighter >= EPSILON_FLOOR {
                        self.resplit(matrix, fragment, tighter, out);
                    } else {
                        debug!(size = fragment.len(), "discarding unsplittable oversized cluster");
                    }
                } else {
                    self.resplit(matrix, fragment, epsilon, out);
                }
            } else {
                out.push(fragment);
            }
        }
    }
}

/// Pairwise cosine-distance matrix with forced zero distance between
/// candidates whose concept texts are identical.
fn distance_matrix(candidates: &[Candidate]) -> Vec<Vec<f32>> {
    let n = candidates.len();
    let mut matrix = vec![vec![0.0f32; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = if candidates[i].concept_text == candidates[j].concept_text {
                0.0
            } else {
                cosine_distance(&candidates[i].embedding, &candidates[j].embedding)
            };
            matrix[i][j] = d;
            matrix[j][i] = d;
        }
    }
    matrix
}

fn submatrix(matrix: &[Vec<f32>], indices: &[usize]) -> Vec<Vec<f32>> {
    indices
        .iter()
        .map(|&i| indices.iter().map(|&j| matrix[i][j]).collect())
        .collect()
}

/// DBSCAN over a precomputed distance matrix.
///
/// Returns one label per point: cluster index ≥ 0 or NOISE. Deterministic
/// for a fixed input ordering.
fn dbscan(matrix: &[Vec<f32>], epsilon: f32, min_neighbors: usize) -> Vec<i64> {
    let n = matrix.len();
    let mut labels = vec![UNVISITED; n];
    let mut cluster = 0i64;

    let neighbors = |p: usize| -> Vec<usize> {
        (0..n).filter(|&q| matrix[p][q] <= epsilon).collect()
    };

    for p in 0..n {
        if labels[p] != UNVISITED {
            continue;
        }
        let seed = neighbors(p);
        if seed.len() < min_neighbors {
            labels[p] = NOISE;
            continue;
        }
        labels[p] = cluster;
        let mut queue: Vec<usize> = seed;
        let mut qi = 0;
        while qi < queue.len() {
            let q = queue[qi];
            qi += 1;
            if labels[q] == NOISE {
                labels[q] = cluster;
            }
            if labels[q] != UNVISITED {
                continue;
            }
            labels[q] = cluster;
            let reach = neighbors(q);
            if reach.len() >= min_neighbors {
                for r in reach {
                    if labels[r] == UNVISITED || labels[r] == NOISE {
                        queue.push(r);
                    }
                }
            }
        }
        cluster += 1;
    }
    labels
}
