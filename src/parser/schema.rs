//! Versioned response schema for AI outcome extraction.

use crate::model::CandidateOutcome;
use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;

/// Identifier of the response contract, recorded in logs and prompts.
pub const SCHEMA_VERSION: &str = "outcomes.v1";

/// Top-level response object expected from the extraction model.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExtractionResponse {
    /// Every learning outcome found in the document.
    pub outcomes: Vec<OutcomeRecord>,
}

/// One outcome as returned by the model.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct OutcomeRecord {
    /// Subject area, e.g. "Science".
    pub subject: String,
    /// Grade level, e.g. "5".
    pub grade: String,
    /// Curriculum code, e.g. "B2.1".
    pub code: String,
    /// Full text of the expectation.
    pub description: String,
    /// Strand or domain the outcome belongs to, if stated.
    #[serde(default)]
    pub domain: Option<String>,
}

/// JSON Schema sent to the model to constrain its output.
pub fn response_schema() -> Value {
    serde_json::to_value(schema_for!(ExtractionResponse)).unwrap_or_default()
}

/// Validate a raw model response against the schema.
///
/// A surrounding Markdown code fence is tolerated. Blank required fields and an empty outcome
/// list are violations.
pub fn validate(raw: &str) -> Result<Vec<CandidateOutcome>, String> {
    let body = strip_code_fence(raw);
    let response: ExtractionResponse =
        serde_json::from_str(body).map_err(|err| format!("response is not valid {SCHEMA_VERSION} JSON: {err}"))?;

    if response.outcomes.is_empty() {
        return Err("response contains no outcomes".to_string());
    }

    response
        .outcomes
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            let field = |name: &str, value: String| {
                let trimmed = value.trim().to_string();
                if trimmed.is_empty() {
                    Err(format!("outcomes[{index}].{name} is blank"))
                } else {
                    Ok(trimmed)
                }
            };
            Ok(CandidateOutcome {
                subject: field("subject", record.subject)?,
                grade: field("grade", record.grade)?,
                code: field("code", record.code)?,
                description: field("description", record.description)?,
                domain: record
                    .domain
                    .map(|domain| domain.trim().to_string())
                    .filter(|domain| !domain.is_empty()),
            })
        })
        .collect()
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
