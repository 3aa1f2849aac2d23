//! AI capability seam for structured outcome extraction.
//!
//! The parser owns validation and retries; clients only move a prompt to a model and hand back
//! the raw text it produced. The Ollama-backed client calls `/api/generate` with the outcome
//! schema as the `format` constraint.

use crate::model::ImportHints;
use crate::retry::Transient;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Errors surfaced by an extraction provider.
#[derive(Debug, Error)]
pub enum ExtractionClientError {
    /// Provider could not be reached.
    #[error("Extraction provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Provider refused the request; repeating it will not help.
    #[error("Extraction request rejected: {0}")]
    Rejected(String),
    /// Provider returned an error response.
    #[error("Failed to generate outcomes: {0}")]
    GenerationFailed(String),
    /// Provider envelope could not be decoded.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

impl Transient for ExtractionClientError {
    fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Input for one extraction call.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    /// Document text, already bounded by the parser.
    pub text: String,
    /// Grade and subject hints from upload.
    pub hints: ImportHints,
    /// JSON Schema the response must satisfy.
    pub schema: Value,
}

/// Interface implemented by structured-extraction providers.
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    /// Model identifier used in logs.
    fn model(&self) -> &str;

    /// Ask the model for outcomes and return its raw, unvalidated response text.
    async fn extract(&self, request: &ExtractionRequest) -> Result<String, ExtractionClientError>;
}

/// Extraction client backed by a local Ollama runtime.
pub struct OllamaExtractionClient {
    http: Client,
    base_url: String,
    model: String,
}

impl OllamaExtractionClient {
    /// Build a client for `model` served at `base_url`.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self, ExtractionClientError> {
        let http = Client::builder()
            .user_agent("curriculum-import/extract")
            .build()
            .map_err(|error| {
                ExtractionClientError::ProviderUnavailable(format!(
                    "failed to construct HTTP client: {error}"
                ))
            })?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            model: model.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    done: bool,
}

#[async_trait]
impl ExtractionClient for OllamaExtractionClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn extract(&self, request: &ExtractionRequest) -> Result<String, ExtractionClientError> {
        let payload = json!({
            "model": self.model,
            "system": SYSTEM_PROMPT,
            "prompt": build_prompt(&request.text, &request.hints),
            "format": request.schema,
            "stream": false,
            "options": {
                "temperature": 0.0,
            }
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                ExtractionClientError::ProviderUnavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        let status = response.status();
        if status.is_client_error()
            && status != StatusCode::REQUEST_TIMEOUT
            && status != StatusCode::TOO_MANY_REQUESTS
        {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionClientError::Rejected(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionClientError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: OllamaResponse = response.json().await.map_err(|error| {
            ExtractionClientError::InvalidResponse(format!(
                "failed to decode Ollama response: {error}"
            ))
        })?;

        if !body.done {
            return Err(ExtractionClientError::InvalidResponse(
                "Ollama response incomplete (streaming not supported)".into(),
            ));
        }

        Ok(body.response)
    }
}

const SYSTEM_PROMPT: &str = "You extract learning outcomes from curriculum documents. \
Return JSON only, matching the provided schema. Copy codes and descriptions verbatim; \
never invent outcomes that are not in the document.";

fn build_prompt(text: &str, hints: &ImportHints) -> String {
    let mut prompt = String::from("Extract every learning outcome (expectation) from the document below.\n");
    if let Some(grade) = &hints.grade {
        prompt.push_str(&format!("The document is for grade {grade}.\n"));
    }
    if let Some(subject) = &hints.subject {
        prompt.push_str(&format!("The subject is {subject}.\n"));
    }
    prompt.push_str("\nDocument:\n");
    prompt.push_str(text);
    prompt
}
