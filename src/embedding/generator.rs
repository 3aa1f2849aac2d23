use super::{EmbeddingCache, EmbeddingClient, EmbeddingError, text_hash};
use crate::model::{OutcomeEmbedding, OutcomeId};
use crate::retry::{RetryPolicy, with_retry};
use futures_util::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;

const DEFAULT_CONCURRENCY: usize = 4;

/// One outcome description awaiting a vector.
#[derive(Debug, Clone)]
pub struct EmbeddingJob {
    /// Outcome the vector is for.
    pub outcome_id: OutcomeId,
    /// Text to embed.
    pub text: String,
}

/// An outcome left without a vector.
#[derive(Debug, Clone)]
pub struct EmbeddingFailure {
    /// Outcome that failed.
    pub outcome_id: OutcomeId,
    /// Cause, shared by every outcome with the same text.
    pub error: Arc<EmbeddingError>,
}

/// Result of embedding a batch; failures never abort the batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Vectors ready to persist, ordered by outcome id.
    pub embedded: Vec<OutcomeEmbedding>,
    /// Outcomes that could not be embedded.
    pub failures: Vec<EmbeddingFailure>,
    /// Distinct texts sent to the provider.
    pub generated: usize,
    /// Distinct texts served from the cache.
    pub cache_hits: usize,
}

/// Embeds texts through a provider with caching, retries, and bounded fan-out.
pub struct EmbeddingGenerator {
    client: Arc<dyn EmbeddingClient>,
    cache: Arc<EmbeddingCache>,
    retry: RetryPolicy,
    concurrency: usize,
    dimension: Option<usize>,
}

impl EmbeddingGenerator {
    /// Generator over `client`, sharing `cache`.
    pub fn new(
        client: Arc<dyn EmbeddingClient>,
        cache: Arc<EmbeddingCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            cache,
            retry,
            concurrency: DEFAULT_CONCURRENCY,
            dimension: None,
        }
    }

    /// Maximum provider calls in flight at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Reject vectors whose length differs from `dimension`.
    pub fn with_dimension(mut self, dimension: Option<usize>) -> Self {
        self.dimension = dimension;
        self
    }

    /// Model identifier of the underlying provider.
    pub fn model(&self) -> &str {
        self.client.model()
    }

    /// Embed one text, consulting the cache first.
    pub async fn embed(&self, text: &str) -> Result<Arc<[f32]>, EmbeddingError> {
        self.embed_hashed(&text_hash(text), text)
            .await
            .map(|(vector, _)| vector)
    }

    /// Embed every job. Identical texts are computed once; each provider call is retried and
    /// at most the configured number run concurrently.
    pub async fn embed_batch(&self, jobs: Vec<EmbeddingJob>) -> BatchReport {
        let mut groups: BTreeMap<String, (String, Vec<OutcomeId>)> = BTreeMap::new();
        for job in jobs {
            let hash = text_hash(&job.text);
            groups
                .entry(hash)
                .or_insert_with(|| (job.text, Vec::new()))
                .1
                .push(job.outcome_id);
        }

        let results: Vec<_> = stream::iter(groups)
            .map(|(hash, (text, outcome_ids))| async move {
                let result = self.embed_hashed(&hash, &text).await;
                (hash, outcome_ids, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let model = self.model().to_string();
        let mut report = BatchReport::default();
        for (hash, outcome_ids, result) in results {
            match result {
                Ok((vector, cached)) => {
                    if cached {
                        report.cache_hits += 1;
                    } else {
                        report.generated += 1;
                    }
                    report
                        .embedded
                        .extend(outcome_ids.into_iter().map(|outcome_id| OutcomeEmbedding {
                            outcome_id,
                            vector: vector.to_vec(),
                            model: model.clone(),
                            text_hash: hash.clone(),
                        }));
                }
                Err(error) => {
                    let error = Arc::new(error);
                    for outcome_id in outcome_ids {
                        tracing::warn!(%outcome_id, error = %error, "Outcome left without embedding");
                        report.failures.push(EmbeddingFailure {
                            outcome_id,
                            error: Arc::clone(&error),
                        });
                    }
                }
            }
        }
        report.embedded.sort_by_key(|embedding| embedding.outcome_id);
        report.failures.sort_by_key(|failure| failure.outcome_id);

        tracing::debug!(
            model = %model,
            generated = report.generated,
            cache_hits = report.cache_hits,
            failures = report.failures.len(),
            "Embedding batch complete"
        );
        report
    }

    async fn embed_hashed(
        &self,
        hash: &str,
        text: &str,
    ) -> Result<(Arc<[f32]>, bool), EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyText);
        }
        let model = self.client.model();
        if let Some(vector) = self.cache.get(hash, model) {
            return Ok((vector, true));
        }

        let vector = with_retry(&self.retry, "embedding", |_| self.client.embed(text)).await?;

        if let Some(expected) = self.dimension {
            if vector.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }
        if vector.iter().any(|value| !value.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }

        let vector: Arc<[f32]> = Arc::from(vector);
        self.cache.insert(hash, model, Arc::clone(&vector));
        Ok((vector, false))
    }
}
