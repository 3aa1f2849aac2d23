//! Embedding providers, the `(text, model)` vector cache, and the bounded-concurrency
//! generator the pipeline uses to embed outcome descriptions.
mod cache;
mod generator;
mod ollama;

pub use cache::EmbeddingCache;
pub use generator::{BatchReport, EmbeddingFailure, EmbeddingGenerator, EmbeddingJob};
pub use ollama::OllamaEmbeddingClient;

use crate::config::{Config, EmbeddingProvider};
use crate::retry::{RetryError, Transient};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingClientError {
    /// Provider could not be reached.
    #[error("Embedding provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Provider refused the request; repeating it will not help.
    #[error("Embedding request rejected: {0}")]
    Rejected(String),
    /// Provider was unable to produce embeddings for the supplied input.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
    /// Provider response could not be parsed.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

impl Transient for EmbeddingClientError {
    fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Why a single outcome could not be embedded.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Provider kept failing or timing out.
    #[error("Embedding failed: {0}")]
    EmbeddingFailed(#[from] RetryError<EmbeddingClientError>),
    /// Provider returned a vector of the wrong length.
    #[error("Embedding has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Length actually returned.
        actual: usize,
    },
    /// Provider returned NaN or infinite components.
    #[error("Embedding contains non-finite values")]
    NonFinite,
    /// Nothing to embed.
    #[error("Cannot embed empty text")]
    EmptyText,
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Model identifier/version; part of every cache key and stored vector.
    fn model(&self) -> &str;

    /// Produce an embedding vector for `text`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingClientError>;
}

/// Deterministic embedder that hashes bytes into a fixed number of slots.
///
/// Needs no external service, which makes it the default for offline runs and tests.
pub struct HashingEmbeddingClient {
    model: String,
    dimension: usize,
}

impl HashingEmbeddingClient {
    /// Construct a hashing client producing `dimension`-length vectors.
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            model: model.into(),
            dimension,
        }
    }

    fn encode(text: &str, dimension: usize) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; dimension];

        if text.is_empty() {
            return embedding;
        }

        for (idx, byte) in text.bytes().enumerate() {
            let position = idx % dimension;
            embedding[position] += f32::from(byte) / 255.0;
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

#[async_trait]
impl EmbeddingClient for HashingEmbeddingClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingClientError> {
        if self.dimension == 0 {
            return Err(EmbeddingClientError::Rejected(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        Ok(Self::encode(text, self.dimension))
    }
}

/// Build the embedding client selected by configuration.
pub fn embedding_client_from_config(
    config: &Config,
) -> Result<Arc<dyn EmbeddingClient>, EmbeddingClientError> {
    tracing::debug!(
        provider = ?config.embedding_provider,
        model = %config.embedding_model,
        dimension = config.embedding_dimension,
        "Building embedding client"
    );
    Ok(match config.embedding_provider {
        EmbeddingProvider::Hashing => Arc::new(HashingEmbeddingClient::new(
            config.embedding_model.clone(),
            config.embedding_dimension,
        )),
        EmbeddingProvider::Ollama => Arc::new(OllamaEmbeddingClient::new(
            config.ollama_url.clone(),
            config.embedding_model.clone(),
        )?),
    })
}

/// Hex-encoded SHA-256 of `text`; keys the cache and marks stored vectors.
pub fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashing_client_is_deterministic_and_normalized() {
        let client = HashingEmbeddingClient::new("hash-8", 8);
        let first = client.embed("analyse food chains").await.expect("vector");
        let second = client.embed("analyse food chains").await.expect("vector");

        assert_eq!(first, second);
        assert_eq!(first.len(), 8);
        let norm: f32 = first.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn zero_dimension_is_rejected() {
        let client = HashingEmbeddingClient::new("hash-0", 0);
        let error = client.embed("text").await.unwrap_err();
        assert!(!error.is_transient());
    }

    #[test]
    fn text_hash_is_stable_sha256() {
        assert_eq!(
            text_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
