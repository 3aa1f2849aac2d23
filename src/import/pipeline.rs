use super::locks::ImportLocks;
use super::mappers::{
    cluster_inputs, current_embeddings, dedupe_candidates, embedding_jobs, unclustered,
};
use super::types::{ImportError, ImportReview, StageFailure, StepReport, UploadRequest};
use crate::cluster::ClusterEngine;
use crate::config::PipelineSettings;
use crate::embedding::{EmbeddingCache, EmbeddingClient, EmbeddingGenerator};
use crate::extract::{ExtractionError, declared_format, extract_text};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::model::{
    Checkpoint, ErrorEntry, Import, ImportId, ImportStatus, InvalidTransition, OutcomeId,
    PipelineStage,
};
use crate::parser::{ExtractionClient, OutcomeParser};
use crate::store::{ImportStore, NewImport, StageCommit, StoreError};
use async_stream::try_stream;
use futures_core::Stream;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// Drives imports through extraction, parsing, embedding, and clustering.
///
/// Every stage commits its output and the next checkpoint in one store call, so an interrupted
/// run resumes from the last committed checkpoint. Runs are exclusive per import; cancellation
/// is honoured between stages.
pub struct ImportPipeline {
    store: Arc<dyn ImportStore>,
    parser: OutcomeParser,
    embeddings: EmbeddingGenerator,
    engine: ClusterEngine,
    settings: PipelineSettings,
    locks: ImportLocks,
    metrics: Arc<PipelineMetrics>,
}

impl ImportPipeline {
    /// Assemble a pipeline over `store` and the two AI capabilities.
    pub fn new(
        store: Arc<dyn ImportStore>,
        extraction: Arc<dyn ExtractionClient>,
        embedding: Arc<dyn EmbeddingClient>,
        cache: Arc<EmbeddingCache>,
        settings: PipelineSettings,
    ) -> Self {
        let parser = OutcomeParser::new(extraction, settings.retry);
        let embeddings = EmbeddingGenerator::new(embedding, cache, settings.retry)
            .with_concurrency(settings.embedding_concurrency)
            .with_dimension(settings.embedding_dimension);
        Self {
            store,
            parser,
            embeddings,
            engine: ClusterEngine::new(settings.cluster),
            settings,
            locks: ImportLocks::default(),
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Replace the outcome parser, e.g. to change how much text is sent to the model.
    pub fn with_parser(mut self, parser: OutcomeParser) -> Self {
        self.parser = parser;
        self
    }

    /// Counters accumulated by this pipeline.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Whether a run currently holds `id`.
    pub fn is_running(&self, id: ImportId) -> bool {
        self.locks.is_held(id)
    }

    /// Validate an upload and create its import in `UPLOADING`.
    pub async fn upload(&self, request: UploadRequest) -> Result<Import, ImportError> {
        let size = request.bytes.len();
        if size == 0 {
            return Err(ImportError::InvalidUpload("document is empty".into()));
        }
        if size > self.settings.max_upload_bytes {
            return Err(ImportError::InvalidUpload(format!(
                "document is {size} bytes; the limit is {}",
                self.settings.max_upload_bytes
            )));
        }
        if let Some(declared) = request.declared_size {
            if declared != size as u64 {
                return Err(ImportError::InvalidUpload(format!(
                    "declared size {declared} does not match received {size} bytes"
                )));
            }
        }
        let file_name = request.file_name.trim();
        if file_name.is_empty() {
            return Err(ImportError::InvalidUpload("file name is required".into()));
        }

        let import = self
            .store
            .create_import(NewImport {
                file_name: file_name.to_string(),
                source_format: declared_format(file_name, request.mime_type.as_deref()),
                mime_type: request.mime_type,
                hints: request.hints,
                document: request.bytes,
            })
            .await?;
        self.metrics.record_created();
        tracing::info!(
            import_id = %import.id,
            file_name = %import.file_name,
            format = %import.source_format,
            bytes = size,
            "Import uploaded"
        );
        Ok(import)
    }

    /// Run the next pending stage, if any.
    pub async fn advance(&self, id: ImportId) -> Result<StepReport, ImportError> {
        let _lease = self.locks.try_acquire(id)?;
        self.step(id).await
    }

    /// Run stages until the import rests in `READY_FOR_REVIEW` or `FAILED`.
    ///
    /// Returns the report of the last stage that ran, or an idle report when nothing was
    /// pending.
    pub async fn run(&self, id: ImportId) -> Result<StepReport, ImportError> {
        let _lease = self.locks.try_acquire(id)?;
        let mut last = self.step(id).await?;
        while last.ran() && last.failure.is_none() {
            let next = self.step(id).await?;
            if !next.ran() {
                break;
            }
            last = next;
        }
        Ok(last)
    }

    /// Run the import in a background task.
    pub fn spawn(self: &Arc<Self>, id: ImportId) -> JoinHandle<Result<StepReport, ImportError>> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.run(id).await })
    }

    /// Stream one report per stage as the import is driven to rest.
    pub fn stages(&self, id: ImportId) -> impl Stream<Item = Result<StepReport, ImportError>> + '_ {
        try_stream! {
            let _lease = self.locks.try_acquire(id)?;
            loop {
                let report = self.step(id).await?;
                if !report.ran() {
                    break;
                }
                let failed = report.failure.is_some();
                yield report;
                if failed {
                    break;
                }
            }
        }
    }

    /// Accept a reviewed import.
    pub async fn confirm(&self, id: ImportId) -> Result<Import, ImportError> {
        self.load(id).await?.status.transition(ImportStatus::Confirmed)?;

        let _lease = self.locks.try_acquire(id)?;
        let import = self.load(id).await?;
        if import.cancel_requested && !import.status.is_terminal() {
            let report = self
                .fail(import, PipelineStage::Review, StageFailure::Cancelled)
                .await?;
            return Err(InvalidTransition {
                from: report.import.status,
                to: ImportStatus::Confirmed,
            }
            .into());
        }
        let status = import.status.transition(ImportStatus::Confirmed)?;
        let commit = StageCommit {
            completed_at: Some(OffsetDateTime::now_utc()),
            ..StageCommit::from_state(&import, status, import.checkpoint)
        };
        let confirmed = self.store.commit(id, commit).await?;
        self.metrics.record_confirmed();
        tracing::info!(import_id = %id, outcomes = confirmed.total_outcomes, "Import confirmed");
        Ok(confirmed)
    }

    /// Cancel an import.
    ///
    /// The flag is set immediately. When a run holds the import, this waits for it to reach
    /// the next stage boundary, where the run itself applies the cancellation.
    pub async fn cancel(&self, id: ImportId) -> Result<Import, ImportError> {
        let import = self.load(id).await?;
        if import.status.is_terminal() {
            return Err(InvalidTransition {
                from: import.status,
                to: ImportStatus::Failed,
            }
            .into());
        }
        match self.store.request_cancellation(id).await {
            Ok(_) => {}
            Err(StoreError::Terminal { status, .. }) => {
                return Err(InvalidTransition {
                    from: status,
                    to: ImportStatus::Failed,
                }
                .into());
            }
            Err(error) => return Err(error.into()),
        }
        tracing::info!(import_id = %id, running = self.is_running(id), "Cancellation requested");

        let _lease = self.locks.acquire(id).await;
        let current = self.load(id).await?;
        match current.status {
            ImportStatus::Failed => Ok(current),
            ImportStatus::Confirmed => Err(InvalidTransition {
                from: ImportStatus::Confirmed,
                to: ImportStatus::Failed,
            }
            .into()),
            _ => {
                let stage = current.next_stage().unwrap_or(PipelineStage::Review);
                let report = self.fail(current, stage, StageFailure::Cancelled).await?;
                Ok(report.import)
            }
        }
    }

    /// Create a fresh import from a failed import's document.
    pub async fn resubmit(&self, id: ImportId) -> Result<Import, ImportError> {
        let failed = self.load(id).await?;
        if failed.status != ImportStatus::Failed {
            return Err(InvalidTransition {
                from: failed.status,
                to: ImportStatus::Uploading,
            }
            .into());
        }
        let document = self
            .store
            .document(id)
            .await?
            .ok_or(ImportError::DocumentUnavailable(id))?;
        let import = self
            .store
            .create_import(NewImport {
                file_name: failed.file_name,
                mime_type: failed.mime_type,
                source_format: failed.source_format,
                hints: failed.hints,
                document,
            })
            .await?;
        self.metrics.record_created();
        tracing::info!(previous = %id, import_id = %import.id, "Import resubmitted");
        Ok(import)
    }

    /// Delete an import with its clusters, outcome links, and document.
    pub async fn delete(&self, id: ImportId) -> Result<(), ImportError> {
        let _lease = self.locks.try_acquire(id)?;
        if self.store.delete_import(id).await? {
            tracing::info!(import_id = %id, "Import deleted");
            Ok(())
        } else {
            Err(ImportError::NotFound(id))
        }
    }

    /// Import with its outcomes and clusters for review.
    pub async fn get_import(&self, id: ImportId) -> Result<ImportReview, ImportError> {
        let import = self.load(id).await?;
        let outcomes = self.store.outcomes_for_import(id).await?;
        let clusters = self.store.clusters_for_import(id).await?;
        Ok(ImportReview {
            unclustered: unclustered(&outcomes, &clusters),
            degraded: import.clustering_degraded,
            import,
            outcomes,
            clusters,
        })
    }

    async fn load(&self, id: ImportId) -> Result<Import, ImportError> {
        self.store
            .get_import(id)
            .await?
            .ok_or(ImportError::NotFound(id))
    }

    /// Run whichever stage the import's checkpoint calls for. Caller holds the lease.
    async fn step(&self, id: ImportId) -> Result<StepReport, ImportError> {
        let import = self.load(id).await?;
        if import.status.is_terminal() {
            return Ok(StepReport::idle(import));
        }
        if import.cancel_requested {
            let stage = import.next_stage().unwrap_or(PipelineStage::Review);
            return self.fail(import, stage, StageFailure::Cancelled).await;
        }
        let Some(stage) = import.next_stage() else {
            return Ok(StepReport::idle(import));
        };

        tracing::debug!(import_id = %id, %stage, "Running stage");
        match stage {
            PipelineStage::Extraction => self.extract(import).await,
            PipelineStage::Parsing => self.parse(import).await,
            PipelineStage::Embedding => self.embed(import).await,
            PipelineStage::Clustering => self.cluster(import).await,
            PipelineStage::Intake | PipelineStage::Review => Ok(StepReport::idle(import)),
        }
    }

    async fn extract(&self, import: Import) -> Result<StepReport, ImportError> {
        let stage = PipelineStage::Extraction;
        let Some(bytes) = self.store.document(import.id).await? else {
            let error = ExtractionError::failed("document bytes are no longer stored");
            return self.fail(import, stage, error.into()).await;
        };

        let declared = import.source_format.clone();
        let extracted = tokio::task::spawn_blocking(move || extract_text(&bytes, &declared))
            .await
            .map_err(|err| ImportError::Task(err.to_string()))?;
        let text = match extracted {
            Ok(text) => text,
            Err(error) => return self.fail(import, stage, error.into()).await,
        };

        let chars = text.chars().count();
        let status = status_after(&import, ImportStatus::Processing)?;
        let commit = StageCommit {
            raw_text: Some(text),
            ..StageCommit::from_state(&import, status, Checkpoint::Extracted)
        };
        let updated = self.store.commit(import.id, commit).await?;
        tracing::info!(import_id = %updated.id, chars, "Extraction committed");
        Ok(StepReport::completed(updated, stage))
    }

    async fn parse(&self, import: Import) -> Result<StepReport, ImportError> {
        let stage = PipelineStage::Parsing;
        let text = import.raw_text.clone().unwrap_or_default();
        let candidates = match self.parser.parse(&text, &import.hints).await {
            Ok(candidates) => candidates,
            Err(error) => return self.fail(import, stage, error.into()).await,
        };

        let (unique, duplicates) = dedupe_candidates(candidates);
        if duplicates > 0 {
            tracing::debug!(import_id = %import.id, duplicates, "Dropped repeated outcome codes");
        }
        let total = unique.len() as u32;
        let status = status_after(&import, ImportStatus::Processing)?;
        let commit = StageCommit {
            outcomes: Some(unique),
            total_outcomes: Some(total),
            processed_outcomes: Some(0),
            ..StageCommit::from_state(&import, status, Checkpoint::Parsed)
        };
        let updated = self.store.commit(import.id, commit).await?;
        self.metrics.record_parsed(u64::from(total));
        tracing::info!(import_id = %updated.id, outcomes = total, duplicates, "Parsing committed");
        Ok(StepReport::completed(updated, stage))
    }

    async fn embed(&self, import: Import) -> Result<StepReport, ImportError> {
        let stage = PipelineStage::Embedding;
        let outcomes = self.store.outcomes_for_import(import.id).await?;
        let ids: Vec<OutcomeId> = outcomes.iter().map(|outcome| outcome.id).collect();
        let stored = self.store.embeddings_for(&ids).await?;
        let current = current_embeddings(&outcomes, stored, self.embeddings.model());
        let reused = current.len();

        let report = self
            .embeddings
            .embed_batch(embedding_jobs(&outcomes, &current))
            .await;

        let codes: HashMap<OutcomeId, &str> = outcomes
            .iter()
            .map(|outcome| (outcome.id, outcome.code.as_str()))
            .collect();
        let errors: Vec<ErrorEntry> = report
            .failures
            .iter()
            .map(|failure| {
                let code = codes.get(&failure.outcome_id).copied().unwrap_or("?");
                ErrorEntry::warning(stage, format!("outcome {code}: {}", failure.error))
            })
            .collect();

        let processed = (outcomes.len() as u32).min(import.total_outcomes);
        let status = status_after(&import, ImportStatus::Processing)?;
        let failures = report.failures.len();
        let commit = StageCommit {
            embeddings: report.embedded,
            processed_outcomes: Some(processed),
            errors,
            ..StageCommit::from_state(&import, status, Checkpoint::Embedded)
        };
        let updated = self.store.commit(import.id, commit).await?;
        self.metrics.record_embeddings(
            report.generated as u64,
            (report.cache_hits + reused) as u64,
            failures as u64,
        );
        tracing::info!(
            import_id = %updated.id,
            generated = report.generated,
            cache_hits = report.cache_hits,
            reused,
            failures,
            "Embedding committed"
        );
        Ok(StepReport::completed(updated, stage))
    }

    async fn cluster(&self, import: Import) -> Result<StepReport, ImportError> {
        let stage = PipelineStage::Clustering;
        let outcomes = self.store.outcomes_for_import(import.id).await?;
        let ids: Vec<OutcomeId> = outcomes.iter().map(|outcome| outcome.id).collect();
        let stored = self.store.embeddings_for(&ids).await?;
        let current = current_embeddings(&outcomes, stored, self.embeddings.model());
        let inputs = cluster_inputs(&outcomes, &current);

        let missing = outcomes.len() - inputs.len();
        let degraded = !outcomes.is_empty()
            && missing as f32 / outcomes.len() as f32 > self.settings.degraded_ratio;

        let engine = self.engine;
        let output = tokio::task::spawn_blocking(move || engine.cluster(inputs))
            .await
            .map_err(|err| ImportError::Task(err.to_string()))?;
        let cluster_count = output.clusters.len();

        let status = status_after(&import, ImportStatus::ReadyForReview)?;
        let mut commit = StageCommit {
            clusters: Some(output.clusters),
            clustering_degraded: Some(degraded),
            processed_at: Some(OffsetDateTime::now_utc()),
            ..StageCommit::from_state(&import, status, Checkpoint::Clustered)
        };
        if degraded {
            tracing::warn!(import_id = %import.id, missing, total = outcomes.len(), "Clustering degraded");
            commit = commit.with_error(ErrorEntry::warning(
                stage,
                format!(
                    "ClusteringDegraded: {missing} of {} outcomes have no embedding",
                    outcomes.len()
                ),
            ));
        }
        let updated = self.store.commit(import.id, commit).await?;
        self.metrics.record_ready(cluster_count as u64);
        tracing::info!(
            import_id = %updated.id,
            clusters = cluster_count,
            unclustered = output.unclustered.len(),
            degraded,
            "Import ready for review"
        );
        Ok(StepReport::completed(updated, stage))
    }

    async fn fail(
        &self,
        import: Import,
        stage: PipelineStage,
        failure: StageFailure,
    ) -> Result<StepReport, ImportError> {
        let status = import.status.transition(ImportStatus::Failed)?;
        let commit = StageCommit {
            completed_at: Some(OffsetDateTime::now_utc()),
            ..StageCommit::from_state(&import, status, import.checkpoint)
        }
        .with_error(ErrorEntry::fatal(stage, failure.log_message()));
        let updated = self.store.commit(import.id, commit).await?;
        self.metrics.record_failed();
        tracing::warn!(import_id = %updated.id, %stage, error = %failure, "Import failed");
        Ok(StepReport {
            import: updated,
            stage: Some(stage),
            failure: Some(failure),
        })
    }
}

/// `target` when the import is already there, otherwise the validated transition to it.
fn status_after(import: &Import, target: ImportStatus) -> Result<ImportStatus, ImportError> {
    if import.status == target {
        Ok(target)
    } else {
        Ok(import.status.transition(target)?)
    }
}
