//! Turns extracted document text into validated candidate outcomes.
//!
//! The parser sends bounded text plus upload hints to an [`ExtractionClient`], validates the
//! raw response against the versioned schema in [`schema`], and retries with backoff when the
//! provider fails or the response does not conform. Only schema-valid outcomes ever leave this
//! module.
pub mod client;
pub mod schema;

pub use client::{ExtractionClient, ExtractionClientError, ExtractionRequest, OllamaExtractionClient};

use crate::model::{CandidateOutcome, ImportHints};
use crate::retry::{RetryPolicy, Transient, with_retry};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Characters of document text forwarded to the model.
pub const DEFAULT_MAX_INPUT_CHARS: usize = 60_000;

/// Terminal failure of outcome parsing.
#[derive(Debug, Error)]
pub enum ParseError {
    /// No schema-valid response was obtained within the attempt budget.
    #[error("Outcome parsing failed after {attempts} attempt(s): {message}")]
    ParseFailed {
        /// Attempts made.
        attempts: u32,
        /// Diagnosis of the final attempt.
        message: String,
        /// Raw text of the last response received, if any.
        last_response: Option<String>,
    },
}

#[derive(Debug)]
enum AttemptError {
    Client(ExtractionClientError),
    Schema(String),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(error) => error.fmt(f),
            Self::Schema(reason) => write!(f, "response violates {}: {reason}", schema::SCHEMA_VERSION),
        }
    }
}

impl Transient for AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Client(error) => error.is_transient(),
            Self::Schema(_) => true,
        }
    }
}

/// Schema-validating outcome parser.
pub struct OutcomeParser {
    client: Arc<dyn ExtractionClient>,
    retry: RetryPolicy,
    max_input_chars: usize,
    schema: Value,
}

impl OutcomeParser {
    /// Parser calling `client` under `retry`.
    pub fn new(client: Arc<dyn ExtractionClient>, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            schema: schema::response_schema(),
        }
    }

    /// Override how much document text is sent to the model.
    pub fn with_max_input_chars(mut self, max_input_chars: usize) -> Self {
        self.max_input_chars = max_input_chars.max(1);
        self
    }

    /// Extract candidate outcomes from `text`.
    pub async fn parse(
        &self,
        text: &str,
        hints: &ImportHints,
    ) -> Result<Vec<CandidateOutcome>, ParseError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ParseError::ParseFailed {
                attempts: 0,
                message: "document text is empty".to_string(),
                last_response: None,
            });
        }

        let bounded = truncate_chars(text, self.max_input_chars);
        if bounded.len() < text.len() {
            tracing::warn!(
                total_bytes = text.len(),
                sent_bytes = bounded.len(),
                "Document text truncated for outcome extraction"
            );
        }

        let request = ExtractionRequest {
            text: bounded.to_string(),
            hints: hints.clone(),
            schema: self.schema.clone(),
        };
        let last_response: Mutex<Option<String>> = Mutex::new(None);
        let client = &self.client;

        let result = with_retry(&self.retry, "outcome_extraction", |attempt| {
            let request = &request;
            let last_response = &last_response;
            async move {
                tracing::debug!(attempt, model = client.model(), "Requesting outcome extraction");
                let raw = client.extract(request).await.map_err(AttemptError::Client)?;
                let validated = schema::validate(&raw);
                *last_response.lock().unwrap_or_else(PoisonError::into_inner) = Some(raw);
                validated.map_err(AttemptError::Schema)
            }
        })
        .await;

        match result {
            Ok(outcomes) => {
                tracing::info!(
                    outcomes = outcomes.len(),
                    model = self.client.model(),
                    schema = schema::SCHEMA_VERSION,
                    "Parsed candidate outcomes"
                );
                Ok(outcomes)
            }
            Err(error) => Err(ParseError::ParseFailed {
                attempts: error.attempts(),
                message: error.to_string(),
                last_response: last_response
                    .into_inner()
                    .unwrap_or_else(PoisonError::into_inner),
            }),
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}
