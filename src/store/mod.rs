//! Persistence boundary for imports and the entities the pipeline produces.
//!
//! Each pipeline stage's output lands through a single [`ImportStore::commit`] call, which
//! applies the whole [`StageCommit`] or nothing. A commit names the status and checkpoint it
//! expects to find, so a stale writer cannot overwrite newer progress.
mod memory;

pub use memory::MemoryStore;

use crate::cluster::ClusterDraft;
use crate::model::{
    CandidateOutcome, Checkpoint, ErrorEntry, Import, ImportHints, ImportId, ImportStatus,
    Outcome, OutcomeCluster, OutcomeEmbedding, OutcomeId,
};
use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

/// Errors raised by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Import does not exist.
    #[error("Import {0} not found")]
    NotFound(ImportId),
    /// Import no longer matches the commit's expected status and checkpoint.
    #[error(
        "Import {id} changed concurrently: expected {expected_status}/{expected_checkpoint:?}, found {found_status}/{found_checkpoint:?}"
    )]
    Conflict {
        /// Import being committed.
        id: ImportId,
        /// Status the writer expected.
        expected_status: ImportStatus,
        /// Checkpoint the writer expected.
        expected_checkpoint: Checkpoint,
        /// Status actually stored.
        found_status: ImportStatus,
        /// Checkpoint actually stored.
        found_checkpoint: Checkpoint,
    },
    /// Import already reached a terminal status.
    #[error("Import {id} is already {status}")]
    Terminal {
        /// Import addressed.
        id: ImportId,
        /// Its terminal status.
        status: ImportStatus,
    },
    /// Commit would break an import invariant.
    #[error("Commit rejected: {0}")]
    Invariant(String),
    /// Backend failed.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Everything needed to create an import.
#[derive(Debug, Clone)]
pub struct NewImport {
    /// Original file name.
    pub file_name: String,
    /// Declared mime type.
    pub mime_type: Option<String>,
    /// Declared source format.
    pub source_format: String,
    /// Upload hints.
    pub hints: ImportHints,
    /// Document bytes; retained for resubmission.
    pub document: Vec<u8>,
}

/// One stage's output, applied atomically.
#[derive(Debug, Clone)]
pub struct StageCommit {
    /// Status the import must currently have.
    pub expected_status: ImportStatus,
    /// Checkpoint the import must currently have.
    pub expected_checkpoint: Checkpoint,
    /// Status after the commit.
    pub status: ImportStatus,
    /// Checkpoint after the commit.
    pub checkpoint: Checkpoint,
    /// Extracted text to record.
    pub raw_text: Option<String>,
    /// Outcomes to upsert by code and link to the import, replacing prior links.
    pub outcomes: Option<Vec<CandidateOutcome>>,
    /// New value of `total_outcomes`.
    pub total_outcomes: Option<u32>,
    /// New value of `processed_outcomes`.
    pub processed_outcomes: Option<u32>,
    /// Vectors to upsert by outcome.
    pub embeddings: Vec<OutcomeEmbedding>,
    /// Clusters replacing the import's current clusters.
    pub clusters: Option<Vec<ClusterDraft>>,
    /// Entries appended to the error log.
    pub errors: Vec<ErrorEntry>,
    /// New value of the degraded-clustering flag.
    pub clustering_degraded: Option<bool>,
    /// Sets `processed_at`.
    pub processed_at: Option<OffsetDateTime>,
    /// Sets `completed_at`.
    pub completed_at: Option<OffsetDateTime>,
}

impl StageCommit {
    /// Commit that expects `current`'s status and checkpoint and moves it to the given ones.
    pub fn from_state(current: &Import, status: ImportStatus, checkpoint: Checkpoint) -> Self {
        Self {
            expected_status: current.status,
            expected_checkpoint: current.checkpoint,
            status,
            checkpoint,
            raw_text: None,
            outcomes: None,
            total_outcomes: None,
            processed_outcomes: None,
            embeddings: Vec::new(),
            clusters: None,
            errors: Vec::new(),
            clustering_degraded: None,
            processed_at: None,
            completed_at: None,
        }
    }

    /// Append an error log entry.
    pub fn with_error(mut self, entry: ErrorEntry) -> Self {
        self.errors.push(entry);
        self
    }
}

/// Durable storage for imports, outcomes, embeddings, and clusters.
#[async_trait]
pub trait ImportStore: Send + Sync {
    /// Create an import in `UPLOADING` at checkpoint `Uploaded`.
    async fn create_import(&self, import: NewImport) -> Result<Import, StoreError>;

    /// Load an import.
    async fn get_import(&self, id: ImportId) -> Result<Option<Import>, StoreError>;

    /// Uploaded bytes of an import.
    async fn document(&self, id: ImportId) -> Result<Option<Vec<u8>>, StoreError>;

    /// Apply `commit` atomically if the import still matches its expectations.
    async fn commit(&self, id: ImportId, commit: StageCommit) -> Result<Import, StoreError>;

    /// Set the cancellation flag without touching any other field. Fails with
    /// [`StoreError::Terminal`] once the import is `CONFIRMED` or `FAILED`.
    async fn request_cancellation(&self, id: ImportId) -> Result<Import, StoreError>;

    /// Outcomes linked to an import, ordered by code.
    async fn outcomes_for_import(&self, id: ImportId) -> Result<Vec<Outcome>, StoreError>;

    /// Outcome holding `code`, compared by its normalized form.
    async fn find_outcome_by_code(&self, code: &str) -> Result<Option<Outcome>, StoreError>;

    /// Stored vectors for the given outcomes.
    async fn embeddings_for(
        &self,
        outcome_ids: &[OutcomeId],
    ) -> Result<Vec<OutcomeEmbedding>, StoreError>;

    /// Clusters of an import, in engine order.
    async fn clusters_for_import(&self, id: ImportId) -> Result<Vec<OutcomeCluster>, StoreError>;

    /// Remove an import with its clusters, outcome links, and document. Outcomes and
    /// embeddings survive. Returns whether the import existed.
    async fn delete_import(&self, id: ImportId) -> Result<bool, StoreError>;
}
