use super::{ImportStore, NewImport, StageCommit, StoreError};
use crate::model::{
    CandidateOutcome, Checkpoint, ClusterId, Import, ImportId, ImportStatus, Outcome,
    OutcomeCluster, OutcomeEmbedding, OutcomeId, normalize_code,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    imports: HashMap<ImportId, Import>,
    documents: HashMap<ImportId, Vec<u8>>,
    outcomes: HashMap<OutcomeId, Outcome>,
    codes: HashMap<String, OutcomeId>,
    memberships: HashMap<ImportId, Vec<OutcomeId>>,
    embeddings: HashMap<OutcomeId, OutcomeEmbedding>,
    clusters: HashMap<ImportId, Vec<OutcomeCluster>>,
}

/// In-memory [`ImportStore`] for the CLI and tests.
///
/// A single lock guards every table, so each commit is applied atomically.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Reject commits that would leave the import inconsistent. Runs before any mutation.
fn validate(state: &State, current: &Import, commit: &StageCommit) -> Result<(), StoreError> {
    if current.status != commit.expected_status || current.checkpoint != commit.expected_checkpoint
    {
        return Err(StoreError::Conflict {
            id: current.id,
            expected_status: commit.expected_status,
            expected_checkpoint: commit.expected_checkpoint,
            found_status: current.status,
            found_checkpoint: current.checkpoint,
        });
    }
    if commit.status != current.status && !current.status.can_transition_to(commit.status) {
        return Err(StoreError::Invariant(format!(
            "illegal transition {} -> {}",
            current.status, commit.status
        )));
    }
    if commit.checkpoint < current.checkpoint {
        return Err(StoreError::Invariant(format!(
            "checkpoint cannot move back from {:?} to {:?}",
            current.checkpoint, commit.checkpoint
        )));
    }

    let total = commit.total_outcomes.unwrap_or(current.total_outcomes);
    let processed = commit.processed_outcomes.unwrap_or(current.processed_outcomes);
    if let Some(outcomes) = &commit.outcomes {
        let distinct = distinct_codes(outcomes);
        if total as usize != distinct {
            return Err(StoreError::Invariant(format!(
                "total_outcomes {total} does not match {distinct} distinct outcomes"
            )));
        }
    }
    if processed > total {
        return Err(StoreError::Invariant(format!(
            "processed_outcomes {processed} exceeds total_outcomes {total}"
        )));
    }

    let unknown_embedding = commit
        .embeddings
        .iter()
        .find(|embedding| !state.outcomes.contains_key(&embedding.outcome_id));
    if let Some(embedding) = unknown_embedding {
        return Err(StoreError::Invariant(format!(
            "embedding references unknown outcome {}",
            embedding.outcome_id
        )));
    }

    if let Some(clusters) = &commit.clusters {
        let linked: HashSet<&OutcomeId> = state
            .memberships
            .get(&current.id)
            .map(|ids| ids.iter().collect())
            .unwrap_or_default();
        for cluster in clusters {
            if cluster.outcome_ids.is_empty() {
                return Err(StoreError::Invariant("cluster has no members".into()));
            }
            if let Some(stray) = cluster.outcome_ids.iter().find(|id| !linked.contains(id)) {
                return Err(StoreError::Invariant(format!(
                    "cluster member {stray} is not linked to import {}",
                    current.id
                )));
            }
        }
    }
    Ok(())
}

fn distinct_codes(outcomes: &[CandidateOutcome]) -> usize {
    outcomes
        .iter()
        .map(|outcome| normalize_code(&outcome.code))
        .collect::<HashSet<_>>()
        .len()
}

/// Insert or supersede outcomes by normalized code; returns the linked ids in input order.
fn upsert_outcomes(
    state: &mut State,
    import_id: ImportId,
    candidates: Vec<CandidateOutcome>,
) -> Vec<OutcomeId> {
    let mut seen = HashSet::new();
    let mut linked = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let key = normalize_code(&candidate.code);
        if !seen.insert(key.clone()) {
            continue;
        }
        let outcome = Outcome {
            id: OutcomeId::new(),
            import_id: Some(import_id),
            subject: candidate.subject,
            grade: candidate.grade,
            code: candidate.code,
            description: candidate.description,
            domain: candidate.domain,
        };
        let outcome_id = match state.codes.get(&key).copied() {
            Some(existing) => {
                state
                    .outcomes
                    .insert(existing, Outcome { id: existing, ..outcome });
                existing
            }
            None => {
                state.codes.insert(key, outcome.id);
                let id = outcome.id;
                state.outcomes.insert(id, outcome);
                id
            }
        };
        linked.push(outcome_id);
    }
    linked
}

#[async_trait]
impl ImportStore for MemoryStore {
    async fn create_import(&self, import: NewImport) -> Result<Import, StoreError> {
        let id = ImportId::new();
        let record = Import {
            id,
            status: ImportStatus::Uploading,
            checkpoint: Checkpoint::Uploaded,
            file_name: import.file_name,
            mime_type: import.mime_type,
            byte_size: import.document.len() as u64,
            source_format: import.source_format,
            hints: import.hints,
            raw_text: None,
            total_outcomes: 0,
            processed_outcomes: 0,
            error_log: Vec::new(),
            clustering_degraded: false,
            cancel_requested: false,
            created_at: OffsetDateTime::now_utc(),
            processed_at: None,
            completed_at: None,
        };
        let mut state = self.state.write().await;
        state.documents.insert(id, import.document);
        state.imports.insert(id, record.clone());
        Ok(record)
    }

    async fn get_import(&self, id: ImportId) -> Result<Option<Import>, StoreError> {
        Ok(self.state.read().await.imports.get(&id).cloned())
    }

    async fn document(&self, id: ImportId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.state.read().await.documents.get(&id).cloned())
    }

    async fn commit(&self, id: ImportId, commit: StageCommit) -> Result<Import, StoreError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let mut import = state
            .imports
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;
        validate(state, &import, &commit)?;

        if let Some(candidates) = commit.outcomes {
            let linked = upsert_outcomes(state, id, candidates);
            state.memberships.insert(id, linked);
        }
        for embedding in commit.embeddings {
            state.embeddings.insert(embedding.outcome_id, embedding);
        }
        if let Some(drafts) = commit.clusters {
            let clusters = drafts
                .into_iter()
                .map(|draft| OutcomeCluster {
                    id: ClusterId::new(),
                    import_id: id,
                    outcome_ids: draft.outcome_ids,
                    centroid: draft.centroid,
                    confidence: draft.confidence,
                    suggested_label: draft.suggested_label,
                    metadata: Some(draft.metadata),
                })
                .collect();
            state.clusters.insert(id, clusters);
        }

        import.status = commit.status;
        import.checkpoint = commit.checkpoint;
        if let Some(raw_text) = commit.raw_text {
            import.raw_text = Some(raw_text);
        }
        if let Some(total) = commit.total_outcomes {
            import.total_outcomes = total;
        }
        if let Some(processed) = commit.processed_outcomes {
            import.processed_outcomes = processed;
        }
        if let Some(degraded) = commit.clustering_degraded {
            import.clustering_degraded = degraded;
        }
        if commit.processed_at.is_some() {
            import.processed_at = commit.processed_at;
        }
        if commit.completed_at.is_some() {
            import.completed_at = commit.completed_at;
        }
        import.error_log.extend(commit.errors);

        state.imports.insert(id, import.clone());
        Ok(import)
    }

    async fn request_cancellation(&self, id: ImportId) -> Result<Import, StoreError> {
        let mut state = self.state.write().await;
        let import = state.imports.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if import.status.is_terminal() {
            return Err(StoreError::Terminal {
                id,
                status: import.status,
            });
        }
        import.cancel_requested = true;
        Ok(import.clone())
    }

    async fn outcomes_for_import(&self, id: ImportId) -> Result<Vec<Outcome>, StoreError> {
        let state = self.state.read().await;
        let mut outcomes: Vec<Outcome> = state
            .memberships
            .get(&id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|outcome_id| state.outcomes.get(outcome_id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        outcomes.sort_by(|a, b| {
            normalize_code(&a.code)
                .cmp(&normalize_code(&b.code))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(outcomes)
    }

    async fn find_outcome_by_code(&self, code: &str) -> Result<Option<Outcome>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .codes
            .get(&normalize_code(code))
            .and_then(|id| state.outcomes.get(id))
            .cloned())
    }

    async fn embeddings_for(
        &self,
        outcome_ids: &[OutcomeId],
    ) -> Result<Vec<OutcomeEmbedding>, StoreError> {
        let state = self.state.read().await;
        Ok(outcome_ids
            .iter()
            .filter_map(|id| state.embeddings.get(id).cloned())
            .collect())
    }

    async fn clusters_for_import(&self, id: ImportId) -> Result<Vec<OutcomeCluster>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .clusters
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_import(&self, id: ImportId) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let existed = state.imports.remove(&id).is_some();
        state.documents.remove(&id);
        state.memberships.remove(&id);
        state.clusters.remove(&id);
        for outcome in state.outcomes.values_mut() {
            if outcome.import_id == Some(id) {
                outcome.import_id = None;
            }
        }
        Ok(existed)
    }
}
