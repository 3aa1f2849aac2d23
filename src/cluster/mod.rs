//! Deterministic grouping of embedded outcomes by cosine similarity.
//!
//! The engine is a pure function of its inputs and [`ClusterSettings`]: the same vectors and
//! codes always produce the same clusters, in the same order, with the same members. Cluster
//! identity is assigned later by the store.
mod engine;

pub use engine::{ClusterEngine, ClusterOutput};

use crate::model::OutcomeId;

const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.80;

/// How outcomes that match nothing are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingletonPolicy {
    /// Emit a one-member cluster with confidence `0`.
    Include,
    /// Leave the outcome unclustered.
    Exclude,
}

/// Tunables of the cluster engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterSettings {
    /// Minimum cosine similarity (inclusive) for two outcomes to seed a cluster, or for an
    /// outcome to join a cluster's centroid.
    pub similarity_threshold: f32,
    /// Treatment of outcomes that end up alone.
    pub singletons: SingletonPolicy,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            singletons: SingletonPolicy::Exclude,
        }
    }
}

/// One embedded outcome offered to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInput {
    /// Outcome the vector belongs to.
    pub outcome_id: OutcomeId,
    /// Outcome code; fixes iteration order and breaks ties.
    pub code: String,
    /// Subject, used as a label fallback.
    pub subject: String,
    /// Domain, preferred for labels.
    pub domain: Option<String>,
    /// Embedding vector.
    pub vector: Vec<f32>,
}

/// A cluster as produced by the engine, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterDraft {
    /// Members ordered by code.
    pub outcome_ids: Vec<OutcomeId>,
    /// Mean of the members' vectors.
    pub centroid: Vec<f32>,
    /// Mean pairwise cosine similarity, clamped to `[0, 1]`; `0` for singletons.
    pub confidence: f32,
    /// Most frequent member domain, falling back to the most frequent subject.
    pub suggested_label: Option<String>,
    /// Member codes and similarity range.
    pub metadata: serde_json::Value,
}

/// Cosine similarity of two vectors.
///
/// Returns `0.0` when the lengths differ or either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let a: Vec<f64> = a.iter().map(|value| f64::from(*value)).collect();
    let b: Vec<f64> = b.iter().map(|value| f64::from(*value)).collect();
    cosine_f64(&a, &b) as f32
}

pub(crate) fn cosine_f64(a: &[f64], b: &[f64]) -> f64 {
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
