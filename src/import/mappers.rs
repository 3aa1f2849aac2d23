//! Mapping helpers between stored entities and stage inputs.

use crate::cluster::ClusterInput;
use crate::embedding::EmbeddingJob;
use crate::model::{
    CandidateOutcome, Outcome, OutcomeCluster, OutcomeEmbedding, OutcomeId, normalize_code,
};
use std::collections::{HashMap, HashSet};

/// Remove candidates whose code repeats within one parse, keeping the first occurrence.
pub(crate) fn dedupe_candidates(
    candidates: Vec<CandidateOutcome>,
) -> (Vec<CandidateOutcome>, usize) {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(candidates.len());
    let mut skipped = 0;

    for candidate in candidates {
        if seen.insert(normalize_code(&candidate.code)) {
            unique.push(candidate);
        } else {
            skipped += 1;
        }
    }

    (unique, skipped)
}

/// Index stored vectors that are still valid for their outcome under `model`.
pub(crate) fn current_embeddings(
    outcomes: &[Outcome],
    stored: Vec<OutcomeEmbedding>,
    model: &str,
) -> HashMap<OutcomeId, OutcomeEmbedding> {
    let by_id: HashMap<OutcomeId, &Outcome> =
        outcomes.iter().map(|outcome| (outcome.id, outcome)).collect();
    stored
        .into_iter()
        .filter(|embedding| {
            by_id
                .get(&embedding.outcome_id)
                .is_some_and(|outcome| embedding.is_current_for(outcome, model))
        })
        .map(|embedding| (embedding.outcome_id, embedding))
        .collect()
}

/// Jobs for outcomes that lack a current vector.
pub(crate) fn embedding_jobs(
    outcomes: &[Outcome],
    current: &HashMap<OutcomeId, OutcomeEmbedding>,
) -> Vec<EmbeddingJob> {
    outcomes
        .iter()
        .filter(|outcome| !current.contains_key(&outcome.id))
        .map(|outcome| EmbeddingJob {
            outcome_id: outcome.id,
            text: outcome.description.clone(),
        })
        .collect()
}

/// Cluster engine inputs for every outcome with a current vector.
pub(crate) fn cluster_inputs(
    outcomes: &[Outcome],
    current: &HashMap<OutcomeId, OutcomeEmbedding>,
) -> Vec<ClusterInput> {
    outcomes
        .iter()
        .filter_map(|outcome| {
            current.get(&outcome.id).map(|embedding| ClusterInput {
                outcome_id: outcome.id,
                code: normalize_code(&outcome.code),
                subject: outcome.subject.clone(),
                domain: outcome.domain.clone(),
                vector: embedding.vector.clone(),
            })
        })
        .collect()
}

/// Outcomes that belong to none of `clusters`, preserving outcome order.
pub(crate) fn unclustered(outcomes: &[Outcome], clusters: &[OutcomeCluster]) -> Vec<OutcomeId> {
    let clustered: HashSet<OutcomeId> = clusters
        .iter()
        .flat_map(|cluster| cluster.outcome_ids.iter().copied())
        .collect();
    outcomes
        .iter()
        .map(|outcome| outcome.id)
        .filter(|id| !clustered.contains(id))
        .collect()
}
