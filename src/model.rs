//! Persisted entities shared by the pipeline stages and the store.
//!
//! An [`Import`] is mutated only by the pipeline; [`Outcome`]s, their embeddings, and the
//! clusters grouping them are produced by pipeline stages and read back for review.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Identifier of an [`Import`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportId(pub Uuid);

/// Identifier of an [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutcomeId(pub Uuid);

/// Identifier of an [`OutcomeCluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub Uuid);

impl ImportId {
    /// Allocate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl OutcomeId {
    /// Allocate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl ClusterId {
    /// Allocate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ImportId {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for OutcomeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ClusterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ImportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for OutcomeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status of an import.
///
/// `UPLOADING → PROCESSING → READY_FOR_REVIEW → CONFIRMED`, with `FAILED` reachable from every
/// non-terminal status. No other edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportStatus {
    /// Document received; nothing extracted yet.
    Uploading,
    /// Pipeline stages are running.
    Processing,
    /// Outcomes and clusters await a reviewer.
    ReadyForReview,
    /// Reviewer accepted the import. Terminal.
    Confirmed,
    /// Import stopped on a fatal error or cancellation. Terminal.
    Failed,
}

impl ImportStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }

    /// Whether `self → next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: ImportStatus) -> bool {
        use ImportStatus::*;
        matches!(
            (self, next),
            (Uploading, Processing)
                | (Processing, ReadyForReview)
                | (ReadyForReview, Confirmed)
                | (Uploading | Processing | ReadyForReview, Failed)
        )
    }

    /// Validate `self → next`, returning the target status when legal.
    pub fn transition(self, next: ImportStatus) -> Result<ImportStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Wire-style name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploading => "UPLOADING",
            Self::Processing => "PROCESSING",
            Self::ReadyForReview => "READY_FOR_REVIEW",
            Self::Confirmed => "CONFIRMED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid state transition from {from} to {to}")]
pub struct InvalidTransition {
    /// Status the import was in.
    pub from: ImportStatus,
    /// Status that was requested.
    pub to: ImportStatus,
}

/// Stages of the import pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Upload intake.
    Intake,
    /// Bytes to plain text.
    Extraction,
    /// Plain text to candidate outcomes.
    Parsing,
    /// Outcome descriptions to vectors.
    Embedding,
    /// Vectors to clusters.
    Clustering,
    /// Human review of the finished import.
    Review,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Intake => "intake",
            Self::Extraction => "extraction",
            Self::Parsing => "parsing",
            Self::Embedding => "embedding",
            Self::Clustering => "clustering",
            Self::Review => "review",
        };
        f.write_str(name)
    }
}

/// Last stage whose output has been durably committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    /// Only the uploaded document exists.
    Uploaded,
    /// Raw text committed.
    Extracted,
    /// Outcomes committed.
    Parsed,
    /// Embeddings committed.
    Embedded,
    /// Clusters committed.
    Clustered,
}

impl Checkpoint {
    /// Stage that runs after this checkpoint, if any.
    pub fn next_stage(self) -> Option<PipelineStage> {
        match self {
            Self::Uploaded => Some(PipelineStage::Extraction),
            Self::Extracted => Some(PipelineStage::Parsing),
            Self::Parsed => Some(PipelineStage::Embedding),
            Self::Embedded => Some(PipelineStage::Clustering),
            Self::Clustered => None,
        }
    }
}

/// One structured entry in an import's error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Stage that produced the entry.
    pub stage: PipelineStage,
    /// Human-readable diagnosis.
    pub message: String,
    /// Whether the entry moved the import to `FAILED`.
    pub fatal: bool,
    /// When the entry was recorded.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ErrorEntry {
    /// Entry for an error that ended the import.
    pub fn fatal(stage: PipelineStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            fatal: true,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Entry for a recorded problem that did not stop the import.
    pub fn warning(stage: PipelineStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            fatal: false,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Optional grade and subject hints supplied at upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportHints {
    /// Grade the document targets.
    pub grade: Option<String>,
    /// Subject the document covers.
    pub subject: Option<String>,
}

impl ImportHints {
    /// Build hints, dropping blank values.
    pub fn new(grade: Option<String>, subject: Option<String>) -> Self {
        Self {
            grade: non_blank(grade),
            subject: non_blank(subject),
        }
    }
}

/// One uploaded document and its pipeline progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Import {
    /// Identity.
    pub id: ImportId,
    /// Lifecycle status.
    pub status: ImportStatus,
    /// Last committed stage.
    pub checkpoint: Checkpoint,
    /// Original file name.
    pub file_name: String,
    /// Declared mime type, if the uploader supplied one.
    pub mime_type: Option<String>,
    /// Size of the uploaded document in bytes.
    pub byte_size: u64,
    /// Declared source format as uploaded; validated during extraction.
    pub source_format: String,
    /// Upload hints forwarded to the outcome parser.
    pub hints: ImportHints,
    /// Extracted plain text, present once extraction has committed.
    pub raw_text: Option<String>,
    /// Distinct outcomes linked to this import.
    pub total_outcomes: u32,
    /// Outcomes that have passed through the embedding stage.
    pub processed_outcomes: u32,
    /// Ordered error log.
    pub error_log: Vec<ErrorEntry>,
    /// Whether too many outcomes lacked embeddings for clustering to be representative.
    pub clustering_degraded: bool,
    /// Cancellation requested; honoured at the next stage boundary.
    pub cancel_requested: bool,
    /// Upload time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When the pipeline reached review.
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    /// When the import reached a terminal status.
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl Import {
    /// Stage the pipeline should run next, or `None` while resting.
    pub fn next_stage(&self) -> Option<PipelineStage> {
        match self.status {
            ImportStatus::Uploading | ImportStatus::Processing => self.checkpoint.next_stage(),
            ImportStatus::ReadyForReview | ImportStatus::Confirmed | ImportStatus::Failed => None,
        }
    }

    /// Fatal entries of the error log.
    pub fn fatal_errors(&self) -> impl Iterator<Item = &ErrorEntry> {
        self.error_log.iter().filter(|entry| entry.fatal)
    }
}

/// Outcome proposed by the parser before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateOutcome {
    /// Subject area.
    pub subject: String,
    /// Grade level.
    pub grade: String,
    /// Curriculum code; globally unique once persisted.
    pub code: String,
    /// Expectation text.
    pub description: String,
    /// Optional strand or domain.
    pub domain: Option<String>,
}

/// A single persisted curriculum expectation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// Identity.
    pub id: OutcomeId,
    /// Import that last produced this outcome; `None` for outcomes created elsewhere.
    pub import_id: Option<ImportId>,
    /// Subject area.
    pub subject: String,
    /// Grade level.
    pub grade: String,
    /// Curriculum code, unique across the system.
    pub code: String,
    /// Expectation text.
    pub description: String,
    /// Optional strand or domain.
    pub domain: Option<String>,
}

/// Vector computed from an outcome's description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEmbedding {
    /// Outcome the vector belongs to.
    pub outcome_id: OutcomeId,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Model identifier/version that produced the vector.
    pub model: String,
    /// Hash of the description the vector was computed from.
    pub text_hash: String,
}

impl OutcomeEmbedding {
    /// Whether this vector may be reused for `outcome` under `model`.
    ///
    /// A vector computed from an older description or a different model is stale.
    pub fn is_current_for(&self, outcome: &Outcome, model: &str) -> bool {
        self.outcome_id == outcome.id
            && self.model == model
            && self.text_hash == crate::embedding::text_hash(&outcome.description)
    }
}

/// Group of thematically similar outcomes within one import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeCluster {
    /// Identity.
    pub id: ClusterId,
    /// Owning import.
    pub import_id: ImportId,
    /// Member outcomes, ordered by code.
    pub outcome_ids: Vec<OutcomeId>,
    /// Mean of the members' vectors.
    pub centroid: Vec<f32>,
    /// Mean pairwise similarity within the cluster, in `[0, 1]`.
    pub confidence: f32,
    /// Optional human-readable label.
    pub suggested_label: Option<String>,
    /// Optional engine diagnostics.
    pub metadata: Option<serde_json::Value>,
}

/// Key under which outcome codes are compared for uniqueness.
///
/// Codes are trimmed, inner whitespace collapsed, and case folded so that `"b2.1"` and
/// `" B2.1 "` name the same outcome.
pub fn normalize_code(code: &str) -> String {
    code.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|input| {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
