use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing import pipeline activity.
#[derive(Default)]
pub struct PipelineMetrics {
    imports_created: AtomicU64,
    imports_ready: AtomicU64,
    imports_confirmed: AtomicU64,
    imports_failed: AtomicU64,
    outcomes_parsed: AtomicU64,
    embeddings_generated: AtomicU64,
    embedding_cache_hits: AtomicU64,
    embedding_failures: AtomicU64,
    clusters_formed: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly uploaded import.
    pub fn record_created(&self) {
        self.imports_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record candidate outcomes accepted from the parser.
    pub fn record_parsed(&self, outcomes: u64) {
        self.outcomes_parsed.fetch_add(outcomes, Ordering::Relaxed);
    }

    /// Record the result of one embedding batch.
    pub fn record_embeddings(&self, generated: u64, cache_hits: u64, failures: u64) {
        self.embeddings_generated
            .fetch_add(generated, Ordering::Relaxed);
        self.embedding_cache_hits
            .fetch_add(cache_hits, Ordering::Relaxed);
        self.embedding_failures
            .fetch_add(failures, Ordering::Relaxed);
    }

    /// Record an import reaching review along with the clusters it produced.
    pub fn record_ready(&self, clusters: u64) {
        self.imports_ready.fetch_add(1, Ordering::Relaxed);
        self.clusters_formed.fetch_add(clusters, Ordering::Relaxed);
    }

    /// Record a confirmed import.
    pub fn record_confirmed(&self) {
        self.imports_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an import moving to `FAILED`.
    pub fn record_failed(&self) {
        self.imports_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            imports_created: self.imports_created.load(Ordering::Relaxed),
            imports_ready: self.imports_ready.load(Ordering::Relaxed),
            imports_confirmed: self.imports_confirmed.load(Ordering::Relaxed),
            imports_failed: self.imports_failed.load(Ordering::Relaxed),
            outcomes_parsed: self.outcomes_parsed.load(Ordering::Relaxed),
            embeddings_generated: self.embeddings_generated.load(Ordering::Relaxed),
            embedding_cache_hits: self.embedding_cache_hits.load(Ordering::Relaxed),
            embedding_failures: self.embedding_failures.load(Ordering::Relaxed),
            clusters_formed: self.clusters_formed.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Imports accepted by upload intake.
    pub imports_created: u64,
    /// Imports that reached `READY_FOR_REVIEW`.
    pub imports_ready: u64,
    /// Imports confirmed by a reviewer.
    pub imports_confirmed: u64,
    /// Imports that ended in `FAILED`.
    pub imports_failed: u64,
    /// Candidate outcomes accepted from the parser.
    pub outcomes_parsed: u64,
    /// Vectors computed by the embedding capability.
    pub embeddings_generated: u64,
    /// Vectors served from cache instead of the capability.
    pub embedding_cache_hits: u64,
    /// Outcomes left unembedded after retries.
    pub embedding_failures: u64,
    /// Clusters committed across all imports.
    pub clusters_formed: u64,
}
