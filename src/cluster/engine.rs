use super::{ClusterDraft, ClusterInput, ClusterSettings, SingletonPolicy, cosine_f64};
use crate::model::OutcomeId;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Scores closer than this are treated as equal so rounding noise cannot break a tie.
const SCORE_TOLERANCE: f64 = 1e-9;

/// Clusters and leftovers produced by one engine run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterOutput {
    /// Clusters ordered by their first member's code.
    pub clusters: Vec<ClusterDraft>,
    /// Outcomes in no cluster, ordered by code.
    pub unclustered: Vec<OutcomeId>,
}

/// Greedy agglomerative clustering over cosine similarity.
///
/// Inputs are ordered by code. At each step the engine takes the single strongest move
/// available: seeding a new cluster from the most similar unassigned pair, or attaching an
/// unassigned outcome to the cluster whose centroid it is closest to. A move qualifies only
/// when its similarity reaches the threshold. Equal scores prefer joining an existing cluster
/// over seeding, larger clusters over smaller ones, then lower code order. The centroid is
/// recomputed after every join, and the run stops when no qualifying move remains.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClusterEngine {
    settings: ClusterSettings,
}

struct Item {
    input: ClusterInput,
    vector: Vec<f64>,
}

struct Working {
    members: Vec<usize>,
    sum: Vec<f64>,
}

#[derive(Clone, Copy)]
struct JoinCandidate {
    score: f64,
    cluster: usize,
    size: usize,
    item: usize,
}

enum Step {
    Seed(usize, usize),
    Join { cluster: usize, item: usize },
}

impl ClusterEngine {
    /// Engine with the given settings.
    pub fn new(settings: ClusterSettings) -> Self {
        Self { settings }
    }

    /// Settings the engine was built with.
    pub fn settings(&self) -> ClusterSettings {
        self.settings
    }

    /// Cluster `inputs`. Input order does not affect the result.
    pub fn cluster(&self, inputs: Vec<ClusterInput>) -> ClusterOutput {
        let (items, mut leftovers) = prepare(inputs);
        let n = items.len();
        let threshold = f64::from(self.settings.similarity_threshold);
        let similarity = pairwise(&items);
        let pairs = candidate_pairs(&similarity, n, threshold);

        let mut assigned: Vec<Option<usize>> = vec![None; n];
        let mut clusters: Vec<Working> = Vec::new();
        let mut join_scores: Vec<Vec<f64>> = Vec::new();
        let mut cursor = 0;

        loop {
            while let Some(&(a, b, _)) = pairs.get(cursor) {
                if assigned[a].is_none() && assigned[b].is_none() {
                    break;
                }
                cursor += 1;
            }
            let seed = pairs.get(cursor).copied();
            let join = best_join(&clusters, &join_scores, &assigned, threshold);

            let step = match (seed, join) {
                (None, None) => break,
                (Some((a, b, _)), None) => Step::Seed(a, b),
                (None, Some(candidate)) => Step::Join {
                    cluster: candidate.cluster,
                    item: candidate.item,
                },
                (Some((a, b, seed_score)), Some(candidate)) => {
                    if candidate.score + SCORE_TOLERANCE >= seed_score {
                        Step::Join {
                            cluster: candidate.cluster,
                            item: candidate.item,
                        }
                    } else {
                        Step::Seed(a, b)
                    }
                }
            };

            let touched = match step {
                Step::Seed(a, b) => {
                    let sum = items[a]
                        .vector
                        .iter()
                        .zip(&items[b].vector)
                        .map(|(x, y)| x + y)
                        .collect();
                    clusters.push(Working {
                        members: vec![a, b],
                        sum,
                    });
                    join_scores.push(Vec::new());
                    let index = clusters.len() - 1;
                    assigned[a] = Some(index);
                    assigned[b] = Some(index);
                    index
                }
                Step::Join { cluster, item } => {
                    let working = &mut clusters[cluster];
                    working.members.push(item);
                    for (total, value) in working.sum.iter_mut().zip(&items[item].vector) {
                        *total += value;
                    }
                    assigned[item] = Some(cluster);
                    cluster
                }
            };

            // Cosine is scale invariant, so the running sum stands in for the mean.
            let centroid = &clusters[touched].sum;
            join_scores[touched] = (0..n)
                .map(|index| {
                    if assigned[index].is_some() {
                        f64::NEG_INFINITY
                    } else {
                        cosine_f64(&items[index].vector, centroid)
                    }
                })
                .collect();
        }

        let mut ordered: Vec<(usize, ClusterDraft)> = clusters
            .into_iter()
            .map(|mut working| {
                working.members.sort_unstable();
                (working.members[0], finish(&working, &items, &similarity, n))
            })
            .collect();

        for (index, item) in items.iter().enumerate() {
            if assigned[index].is_some() {
                continue;
            }
            match self.settings.singletons {
                SingletonPolicy::Include => ordered.push((index, singleton(item))),
                SingletonPolicy::Exclude => {
                    leftovers.push((item.input.code.clone(), item.input.outcome_id))
                }
            }
        }

        ordered.sort_by_key(|(first, _)| *first);
        leftovers.sort();
        ClusterOutput {
            clusters: ordered.into_iter().map(|(_, draft)| draft).collect(),
            unclustered: leftovers.into_iter().map(|(_, id)| id).collect(),
        }
    }
}

/// Order inputs by code and set aside vectors that cannot be compared.
fn prepare(inputs: Vec<ClusterInput>) -> (Vec<Item>, Vec<(String, OutcomeId)>) {
    let dimension = dominant_dimension(&inputs);
    let mut items = Vec::with_capacity(inputs.len());
    let mut rejected = Vec::new();

    for input in inputs {
        let vector: Vec<f64> = input.vector.iter().map(|v| f64::from(*v)).collect();
        let usable = Some(vector.len()) == dimension
            && vector.iter().all(|value| value.is_finite())
            && vector.iter().any(|value| *value != 0.0);
        if usable {
            items.push(Item { input, vector });
        } else {
            tracing::debug!(code = %input.code, len = vector.len(), "Skipping unusable vector");
            rejected.push((input.code, input.outcome_id));
        }
    }

    items.sort_by(|a, b| {
        a.input
            .code
            .cmp(&b.input.code)
            .then_with(|| a.input.outcome_id.cmp(&b.input.outcome_id))
    });
    (items, rejected)
}

/// Most common vector length; ties resolve to the shorter length.
fn dominant_dimension(inputs: &[ClusterInput]) -> Option<usize> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for input in inputs.iter().filter(|input| !input.vector.is_empty()) {
        *counts.entry(input.vector.len()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(dim_a, count_a), (dim_b, count_b)| {
            count_a.cmp(count_b).then_with(|| dim_b.cmp(dim_a))
        })
        .map(|(dimension, _)| dimension)
}

fn pairwise(items: &[Item]) -> Vec<f64> {
    let n = items.len();
    let mut similarity = vec![0.0; n * n];
    for i in 0..n {
        similarity[i * n + i] = 1.0;
        for j in (i + 1)..n {
            let score = cosine_f64(&items[i].vector, &items[j].vector);
            similarity[i * n + j] = score;
            similarity[j * n + i] = score;
        }
    }
    similarity
}

/// Qualifying pairs, strongest first, ties in code order.
fn candidate_pairs(similarity: &[f64], n: usize, threshold: f64) -> Vec<(usize, usize, f64)> {
    let mut pairs = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            let score = similarity[i * n + j];
            if score >= threshold {
                pairs.push((i, j, score));
            }
        }
    }
    pairs.sort_by(|a, b| {
        b.2.total_cmp(&a.2)
            .then_with(|| a.0.cmp(&b.0))
            .then_with(|| a.1.cmp(&b.1))
    });
    pairs
}

fn best_join(
    clusters: &[Working],
    join_scores: &[Vec<f64>],
    assigned: &[Option<usize>],
    threshold: f64,
) -> Option<JoinCandidate> {
    let mut best: Option<JoinCandidate> = None;
    for (cluster, working) in clusters.iter().enumerate() {
        for (item, score) in join_scores[cluster].iter().copied().enumerate() {
            if assigned[item].is_some() || score < threshold {
                continue;
            }
            let candidate = JoinCandidate {
                score,
                cluster,
                size: working.members.len(),
                item,
            };
            let better = match &best {
                None => true,
                Some(current) => compare_join(&candidate, current) == Ordering::Greater,
            };
            if better {
                best = Some(candidate);
            }
        }
    }
    best
}

fn compare_join(a: &JoinCandidate, b: &JoinCandidate) -> Ordering {
    let by_score = if (a.score - b.score).abs() <= SCORE_TOLERANCE {
        Ordering::Equal
    } else {
        a.score.total_cmp(&b.score)
    };
    by_score
        .then_with(|| a.size.cmp(&b.size))
        .then_with(|| b.item.cmp(&a.item))
        .then_with(|| b.cluster.cmp(&a.cluster))
}

fn finish(working: &Working, items: &[Item], similarity: &[f64], n: usize) -> ClusterDraft {
    let count = working.members.len();
    let mut total = 0.0;
    let mut pairs = 0usize;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for (position, &i) in working.members.iter().enumerate() {
        for &j in &working.members[position + 1..] {
            let score = similarity[i * n + j];
            total += score;
            pairs += 1;
            min = min.min(score);
            max = max.max(score);
        }
    }
    let confidence = if pairs == 0 {
        0.0
    } else {
        (total / pairs as f64).clamp(0.0, 1.0)
    };

    let centroid = working
        .sum
        .iter()
        .map(|value| (value / count as f64) as f32)
        .collect();
    let members: Vec<&Item> = working.members.iter().map(|&index| &items[index]).collect();
    let codes: Vec<&str> = members.iter().map(|item| item.input.code.as_str()).collect();

    ClusterDraft {
        outcome_ids: members.iter().map(|item| item.input.outcome_id).collect(),
        centroid,
        confidence: confidence as f32,
        suggested_label: suggest_label(&members),
        metadata: json!({
            "member_codes": codes,
            "min_similarity": min,
            "max_similarity": max,
        }),
    }
}

fn singleton(item: &Item) -> ClusterDraft {
    ClusterDraft {
        outcome_ids: vec![item.input.outcome_id],
        centroid: item.input.vector.clone(),
        confidence: 0.0,
        suggested_label: suggest_label(&[item]),
        metadata: json!({
            "member_codes": [item.input.code],
            "singleton": true,
        }),
    }
}

/// Most frequent member domain, else most frequent subject; ties go to the smaller label.
fn suggest_label(members: &[&Item]) -> Option<String> {
    let domains = members.iter().filter_map(|item| item.input.domain.as_deref());
    most_frequent(domains).or_else(|| {
        most_frequent(members.iter().map(|item| item.input.subject.as_str()))
    })
}

fn most_frequent<'a>(labels: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for label in labels.map(str::trim).filter(|label| !label.is_empty()) {
        *counts.entry(label).or_default() += 1;
    }
    let mut best: Option<(&str, usize)> = None;
    for (label, count) in counts {
        if best.is_none_or(|(_, top)| count > top) {
            best = Some((label, count));
        }
    }
    best.map(|(label, _)| label.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn input(code: &str, vector: Vec<f32>) -> ClusterInput {
        ClusterInput {
            outcome_id: OutcomeId(Uuid::new_v4()),
            code: code.to_string(),
            subject: "Science".to_string(),
            domain: None,
            vector,
        }
    }

    fn engine(singletons: SingletonPolicy) -> ClusterEngine {
        ClusterEngine::new(ClusterSettings {
            similarity_threshold: 0.80,
            singletons,
        })
    }

    /// A·B ≈ 0.95, A·C ≈ 0.20, B·C ≈ 0.25.
    fn triangle() -> Vec<ClusterInput> {
        vec![
            input("A", vec![1.0, 0.0, 0.0]),
            input("B", vec![0.95, 0.312_25, 0.0]),
            input("C", vec![0.2, 0.192_2, 0.960_7]),
        ]
    }

    #[test]
    fn groups_the_similar_pair_and_leaves_the_outlier() {
        let inputs = triangle();
        let (a, b, c) = (
            inputs[0].outcome_id,
            inputs[1].outcome_id,
            inputs[2].outcome_id,
        );

        let output = engine(SingletonPolicy::Exclude).cluster(inputs);

        assert_eq!(output.clusters.len(), 1);
        let cluster = &output.clusters[0];
        assert_eq!(cluster.outcome_ids, vec![a, b]);
        assert!((cluster.confidence - 0.95).abs() < 1e-3);
        assert_eq!(output.unclustered, vec![c]);
    }

    #[test]
    fn singleton_policy_emits_zero_confidence_clusters() {
        let inputs = triangle();
        let c = inputs[2].outcome_id;

        let output = engine(SingletonPolicy::Include).cluster(inputs);

        assert_eq!(output.clusters.len(), 2);
        assert!(output.unclustered.is_empty());
        let single = &output.clusters[1];
        assert_eq!(single.outcome_ids, vec![c]);
        assert_eq!(single.confidence, 0.0);
    }

    #[test]
    fn input_order_does_not_change_the_result() {
        let inputs = vec![
            input("S1", vec![1.0, 0.1, 0.0, 0.0]),
            input("S2", vec![0.9, 0.2, 0.0, 0.1]),
            input("S3", vec![0.0, 1.0, 0.1, 0.0]),
            input("S4", vec![0.1, 0.9, 0.0, 0.0]),
            input("S5", vec![0.95, 0.15, 0.05, 0.0]),
            input("S6", vec![0.0, 0.0, 0.0, 1.0]),
        ];
        let mut reversed = inputs.clone();
        reversed.reverse();
        let mut rotated = inputs.clone();
        rotated.rotate_left(2);

        let engine = engine(SingletonPolicy::Include);
        let baseline = engine.cluster(inputs);
        assert_eq!(engine.cluster(reversed), baseline);
        assert_eq!(engine.cluster(rotated), baseline);
    }

    #[test]
    fn outcomes_join_existing_cluster_through_centroid() {
        let inputs = vec![
            input("M1", vec![1.0, 0.0, 0.0]),
            input("M2", vec![0.98, 0.2, 0.0]),
            input("M3", vec![0.9, 0.35, 0.0]),
            input("M4", vec![0.0, 0.0, 1.0]),
        ];
        let ids: Vec<OutcomeId> = inputs.iter().map(|i| i.outcome_id).collect();

        let output = engine(SingletonPolicy::Exclude).cluster(inputs);

        assert_eq!(output.clusters.len(), 1);
        assert_eq!(output.clusters[0].outcome_ids, ids[..3].to_vec());
        assert_eq!(output.unclustered, vec![ids[3]]);
        let centroid = &output.clusters[0].centroid;
        assert!((centroid[0] - (1.0 + 0.98 + 0.9) / 3.0).abs() < 1e-6);
    }

    #[test]
    fn equal_joins_prefer_the_larger_cluster() {
        let inputs = vec![
            input("A1", vec![0.0, 1.0]),
            input("A2", vec![0.0, 1.0]),
            input("M", vec![1.0, 1.0]),
            input("Z1", vec![1.0, 0.0]),
            input("Z2", vec![1.0, 0.0]),
            input("Z3", vec![1.0, 0.0]),
        ];
        let ids: Vec<OutcomeId> = inputs.iter().map(|i| i.outcome_id).collect();

        let output = ClusterEngine::new(ClusterSettings {
            similarity_threshold: 0.7,
            singletons: SingletonPolicy::Exclude,
        })
        .cluster(inputs);

        assert!(output.unclustered.is_empty());
        assert_eq!(output.clusters.len(), 2);
        assert_eq!(output.clusters[0].outcome_ids, vec![ids[0], ids[1]]);
        assert_eq!(
            output.clusters[1].outcome_ids,
            vec![ids[2], ids[3], ids[4], ids[5]]
        );
    }

    #[test]
    fn confidence_stays_within_unit_interval() {
        let inputs = vec![
            input("X1", vec![1.0, 0.0]),
            input("X2", vec![1.0, 0.0]),
            input("X3", vec![0.99, 0.01]),
        ];
        let output = engine(SingletonPolicy::Exclude).cluster(inputs);
        for cluster in &output.clusters {
            assert!((0.0..=1.0).contains(&cluster.confidence));
            assert!(cluster.outcome_ids.len() >= 2);
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        let inputs = vec![input("T1", vec![1.0, 0.0]), input("T2", vec![1.0, 0.0])];
        let output = ClusterEngine::new(ClusterSettings {
            similarity_threshold: 1.0,
            singletons: SingletonPolicy::Exclude,
        })
        .cluster(inputs);
        assert_eq!(output.clusters.len(), 1);
    }

    #[test]
    fn unusable_vectors_are_left_unclustered() {
        let zero = input("Z", vec![0.0, 0.0]);
        let short = input("Y", vec![1.0]);
        let (zero_id, short_id) = (zero.outcome_id, short.outcome_id);
        let inputs = vec![
            input("P1", vec![1.0, 0.0]),
            input("P2", vec![1.0, 0.01]),
            zero,
            short,
        ];

        let output = engine(SingletonPolicy::Include).cluster(inputs);

        assert_eq!(output.clusters.len(), 1);
        assert_eq!(output.unclustered, vec![short_id, zero_id]);
    }

    #[test]
    fn empty_input_produces_nothing() {
        let output = engine(SingletonPolicy::Include).cluster(Vec::new());
        assert_eq!(output, ClusterOutput::default());
    }

    #[test]
    fn label_prefers_domain_then_subject() {
        let mut first = input("L1", vec![1.0, 0.0]);
        let mut second = input("L2", vec![1.0, 0.05]);
        first.domain = Some("Ecosystems".into());
        second.domain = Some("Ecosystems".into());
        let labelled = engine(SingletonPolicy::Exclude).cluster(vec![first, second]);
        assert_eq!(
            labelled.clusters[0].suggested_label.as_deref(),
            Some("Ecosystems")
        );

        let plain = engine(SingletonPolicy::Exclude)
            .cluster(vec![input("L3", vec![1.0, 0.0]), input("L4", vec![1.0, 0.0])]);
        assert_eq!(
            plain.clusters[0].suggested_label.as_deref(),
            Some("Science")
        );
    }

    #[test]
    fn metadata_lists_member_codes() {
        let output = engine(SingletonPolicy::Exclude).cluster(triangle());
        let codes = &output.clusters[0].metadata["member_codes"];
        assert_eq!(codes, &json!(["A", "B"]));
    }
}
