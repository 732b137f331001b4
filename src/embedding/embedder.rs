//! Embedder trait — the contract embedding backends implement
//!
//! Production deployments plug in a model-backed implementation; tests use
//! `StubEmbedder` with preset vectors so distances are deterministic.

use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Errors from embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding returned no results")]
    EmptyResult,
    #[error("embedding model error: {0}")]
    ModelError(String),
}

/// Trait for embedding text into vectors.
pub trait Embedder: Send + Sync {
    /// Embed one text. A zero-length result is an error; callers treat a
    /// *missing* embedding (stored as empty) as maximally distant instead.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// The dimensionality of vectors this embedder produces.
    fn dimensions(&self) -> usize;
}

/// L2-normalize a vector in place.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine distance between two vectors, clamped to [0, 2].
///
/// A missing or all-zero vector is maximally distant (2.0), never an error.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 2.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 2.0;
    }
    (1.0 - dot / (na * nb)).clamp(0.0, 2.0)
}

/// HTTP client for an embedding service.
///
/// Posts `{"text": ...}` and expects `{"embedding": [f32, ...]}` back.
pub struct HttpEmbedder {
    endpoint_url: String,
    dimensions: usize,
    agent: ureq::Agent,
}

impl HttpEmbedder {
    pub fn new(endpoint_url: impl Into<String>, dimensions: usize) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            dimensions,
            agent: ureq::AgentBuilder::new()
                .timeout(std::time::Duration::from_secs(30))
                .build(),
        }
    }
}

impl Embedder for HttpEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .agent
            .post(&self.endpoint_url)
            .send_json(serde_json::json!({ "text": text }))
            .map_err(|e| EmbeddingError::ModelError(e.to_string()))?;
        let body: serde_json::Value = response
            .into_json()
            .map_err(|e| EmbeddingError::ModelError(e.to_string()))?;
        let vector: Vec<f32> = body
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or(EmbeddingError::EmptyResult)?
            .iter()
            .filter_map(|x| x.as_f64())
            .map(|x| x as f32)
            .collect();
        if vector.is_empty() {
            return Err(EmbeddingError::EmptyResult);
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Deterministic embedder for tests: returns preset vectors by exact text.
///
/// Unknown texts get a stable pseudo-vector derived from the text bytes so
/// that identical strings always embed identically.
pub struct StubEmbedder {
    dimensions: usize,
    presets: RwLock<HashMap<String, Vec<f32>>>,
}

impl StubEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            presets: RwLock::new(HashMap::new()),
        }
    }

    /// Register a preset vector for an exact text.
    pub fn preset(&self, text: impl Into<String>, vector: Vec<f32>) {
        self.presets.write().unwrap().insert(text.into(), vector);
    }

    fn derive(&self, text: &str) -> Vec<f32> {
        // FNV-style rolling hash spread across the dimensions.
        let mut v = vec![0.0f32; self.dimensions];
        let mut h: u64 = 0xcbf29ce484222325;
        for (i, byte) in text.bytes().enumerate() {
            h ^= byte as u64;
            h = h.wrapping_mul(0x100000001b3);
            let slot = (h as usize).wrapping_add(i) % self.dimensions;
            v[slot] += ((h >> 32) as u32 as f32) / (u32::MAX as f32);
        }
        l2_normalize(&mut v);
        v
    }
}

impl Embedder for StubEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Some(preset) = self.presets.read().unwrap().get(text) {
            return Ok(preset.clone());
        }
        Ok(self.derive(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
