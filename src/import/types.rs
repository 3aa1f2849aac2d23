use crate::extract::ExtractionError;
use crate::model::{
    Import, ImportHints, ImportId, InvalidTransition, Outcome, OutcomeCluster, OutcomeId,
    PipelineStage,
};
use crate::parser::ParseError;
use crate::store::StoreError;
use serde::Serialize;
use thiserror::Error;

/// Characters of a failed model response kept in the error log.
const LOGGED_RESPONSE_CHARS: usize = 2000;

/// A document submitted for import.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Original file name; its extension declares the format.
    pub file_name: String,
    /// Declared mime type, used when the name has no extension.
    pub mime_type: Option<String>,
    /// Size the uploader claims; must match the bytes when present.
    pub declared_size: Option<u64>,
    /// Document contents.
    pub bytes: Vec<u8>,
    /// Optional grade and subject hints.
    pub hints: ImportHints,
}

/// Errors returned to callers of the import pipeline.
///
/// Stage failures are not errors here: they are committed to the import and reported through
/// [`StepReport::failure`].
#[derive(Debug, Error)]
pub enum ImportError {
    /// Import does not exist.
    #[error("Import {0} not found")]
    NotFound(ImportId),
    /// Requested status change is not an edge of the lifecycle.
    #[error(transparent)]
    InvalidStateTransition(#[from] InvalidTransition),
    /// Another pipeline run holds the import.
    #[error("Import {0} already has an active pipeline run")]
    AlreadyRunning(ImportId),
    /// Upload rejected at intake.
    #[error("Invalid upload: {0}")]
    InvalidUpload(String),
    /// Uploaded bytes are gone, so the import cannot be resubmitted.
    #[error("Document for import {0} is no longer available")]
    DocumentUnavailable(ImportId),
    /// Persistence failed.
    #[error("Storage failure: {0}")]
    Store(StoreError),
    /// Blocking worker panicked or was cancelled.
    #[error("Pipeline task failed: {0}")]
    Task(String),
}

impl From<StoreError> for ImportError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Fatal stage outcome that moved an import to `FAILED`.
#[derive(Debug, Error)]
pub enum StageFailure {
    /// Document could not be turned into text.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    /// No valid outcomes could be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Cancellation was requested.
    #[error("Import cancelled")]
    Cancelled,
}

impl StageFailure {
    /// Message recorded in the import's error log.
    pub fn log_message(&self) -> String {
        match self {
            Self::Parse(ParseError::ParseFailed {
                last_response: Some(raw),
                ..
            }) => {
                let excerpt: String = raw.chars().take(LOGGED_RESPONSE_CHARS).collect();
                format!("{self}; last response: {excerpt}")
            }
            other => other.to_string(),
        }
    }
}

/// Result of one pipeline step.
#[derive(Debug)]
pub struct StepReport {
    /// Import state after the step.
    pub import: Import,
    /// Stage that ran; `None` when the import was resting and nothing ran.
    pub stage: Option<PipelineStage>,
    /// Set when the step moved the import to `FAILED`.
    pub failure: Option<StageFailure>,
}

impl StepReport {
    pub(crate) fn idle(import: Import) -> Self {
        Self {
            import,
            stage: None,
            failure: None,
        }
    }

    pub(crate) fn completed(import: Import, stage: PipelineStage) -> Self {
        Self {
            import,
            stage: Some(stage),
            failure: None,
        }
    }

    /// Whether the step ran a stage.
    pub fn ran(&self) -> bool {
        self.stage.is_some()
    }
}

/// Everything a reviewer needs to look at a finished import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReview {
    /// The import.
    pub import: Import,
    /// Linked outcomes, ordered by code.
    pub outcomes: Vec<Outcome>,
    /// Clusters, in engine order.
    pub clusters: Vec<OutcomeCluster>,
    /// Linked outcomes that belong to no cluster.
    pub unclustered: Vec<OutcomeId>,
    /// Whether too few outcomes were embedded for clustering to be representative.
    pub degraded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_failure_log_includes_bounded_response() {
        let failure = StageFailure::Parse(ParseError::ParseFailed {
            attempts: 3,
            message: "schema violation".into(),
            last_response: Some("x".repeat(5000)),
        });

        let message = failure.log_message();

        assert!(message.starts_with("Outcome parsing failed after 3 attempt(s)"));
        assert!(message.ends_with(&"x".repeat(LOGGED_RESPONSE_CHARS)));
        assert!(message.len() < 2200);
    }

    #[test]
    fn store_not_found_maps_to_import_not_found() {
        let id = ImportId::new();
        assert!(matches!(
            ImportError::from(StoreError::NotFound(id)),
            ImportError::NotFound(found) if found == id
        ));
    }
}
