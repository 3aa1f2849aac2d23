use crate::cluster::{ClusterSettings, SingletonPolicy};
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::env;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_EMBEDDING_CONCURRENCY: usize = 4;
const DEFAULT_EMBEDDING_CACHE_CAPACITY: usize = 4096;
const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.80;
const DEFAULT_DEGRADED_RATIO: f32 = 0.5;
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the curriculum import pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base URL of the Ollama runtime serving extraction and embedding models.
    pub ollama_url: String,
    /// Model used for structured outcome extraction.
    pub extraction_model: String,
    /// Embedding provider used to generate vector representations.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier; also the version key of cached vectors.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Maximum number of in-flight embedding calls per import.
    pub embedding_concurrency: usize,
    /// Maximum number of cached `(text, model)` vectors held in memory.
    pub embedding_cache_capacity: usize,
    /// Similarity an outcome needs against a cluster centroid to join it.
    pub cluster_similarity_threshold: f32,
    /// Whether unclustered outcomes are reported as confidence-0 singletons.
    pub cluster_include_singletons: bool,
    /// Unembedded fraction above which clustering is reported as degraded.
    pub cluster_degraded_ratio: f32,
    /// Per-attempt timeout applied to external capability calls.
    pub capability_timeout_secs: u64,
    /// Attempts allowed per external capability call.
    pub capability_max_attempts: u32,
    /// First retry delay in milliseconds; doubled on every further attempt.
    pub capability_retry_base_ms: u64,
    /// Largest document accepted by upload intake.
    pub max_upload_bytes: usize,
}

/// Supported embedding backends for the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local Ollama runtime.
    Ollama,
    /// Deterministic hashing embedder that needs no external service.
    Hashing,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let config = Self {
            ollama_url: vars
                .optional("OLLAMA_URL")
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            extraction_model: vars.required("EXTRACTION_MODEL")?,
            embedding_provider: vars.required("EMBEDDING_PROVIDER")?.parse().map_err(|()| {
                ConfigError::InvalidValue("EMBEDDING_PROVIDER".to_string())
            })?,
            embedding_model: vars.required("EMBEDDING_MODEL")?,
            embedding_dimension: vars.required("EMBEDDING_DIMENSION")?.parse().map_err(|_| {
                ConfigError::InvalidValue("EMBEDDING_DIMENSION".to_string())
            })?,
            embedding_concurrency: vars
                .parsed("EMBEDDING_CONCURRENCY")?
                .unwrap_or(DEFAULT_EMBEDDING_CONCURRENCY),
            embedding_cache_capacity: vars
                .parsed("EMBEDDING_CACHE_CAPACITY")?
                .unwrap_or(DEFAULT_EMBEDDING_CACHE_CAPACITY),
            cluster_similarity_threshold: vars
                .parsed("CLUSTER_SIMILARITY_THRESHOLD")?
                .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
            cluster_include_singletons: vars
                .optional("CLUSTER_INCLUDE_SINGLETONS")
                .map(|value| {
                    parse_flag(&value).ok_or_else(|| {
                        ConfigError::InvalidValue("CLUSTER_INCLUDE_SINGLETONS".to_string())
                    })
                })
                .transpose()?
                .unwrap_or(false),
            cluster_degraded_ratio: vars
                .parsed("CLUSTER_DEGRADED_RATIO")?
                .unwrap_or(DEFAULT_DEGRADED_RATIO),
            capability_timeout_secs: vars
                .parsed("CAPABILITY_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
            capability_max_attempts: vars
                .parsed("CAPABILITY_MAX_ATTEMPTS")?
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            capability_retry_base_ms: vars
                .parsed("CAPABILITY_RETRY_BASE_MS")?
                .unwrap_or(DEFAULT_RETRY_BASE_MS),
            max_upload_bytes: vars
                .parsed("MAX_UPLOAD_BYTES")?
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&str, bool); 7] = [
            ("EMBEDDING_DIMENSION", self.embedding_dimension > 0),
            ("EMBEDDING_CONCURRENCY", self.embedding_concurrency > 0),
            (
                "CLUSTER_SIMILARITY_THRESHOLD",
                (0.0..=1.0).contains(&self.cluster_similarity_threshold),
            ),
            (
                "CLUSTER_DEGRADED_RATIO",
                (0.0..=1.0).contains(&self.cluster_degraded_ratio),
            ),
            ("CAPABILITY_TIMEOUT_SECS", self.capability_timeout_secs > 0),
            ("CAPABILITY_MAX_ATTEMPTS", self.capability_max_attempts > 0),
            ("MAX_UPLOAD_BYTES", self.max_upload_bytes > 0),
        ];
        match checks.into_iter().find(|(_, ok)| !ok) {
            Some((key, _)) => Err(ConfigError::InvalidValue(key.to_string())),
            None => Ok(()),
        }
    }

    /// Derive the settings injected into [`crate::import::ImportPipeline`].
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            retry: RetryPolicy {
                max_attempts: self.capability_max_attempts,
                timeout: Duration::from_secs(self.capability_timeout_secs),
                base_delay: Duration::from_millis(self.capability_retry_base_ms),
                max_delay: MAX_RETRY_DELAY,
            },
            cluster: ClusterSettings {
                similarity_threshold: self.cluster_similarity_threshold,
                singletons: if self.cluster_include_singletons {
                    SingletonPolicy::Include
                } else {
                    SingletonPolicy::Exclude
                },
            },
            embedding_concurrency: self.embedding_concurrency,
            embedding_dimension: Some(self.embedding_dimension),
            degraded_ratio: self.cluster_degraded_ratio,
            max_upload_bytes: self.max_upload_bytes,
        }
    }
}

/// Tunables consumed by the import pipeline.
///
/// Kept separate from [`Config`] so tests and embedders can construct the pipeline without
/// touching process-wide state.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Timeout and backoff applied to AI and embedding calls.
    pub retry: RetryPolicy,
    /// Cluster engine threshold and singleton policy.
    pub cluster: ClusterSettings,
    /// Maximum concurrent embedding calls per import.
    pub embedding_concurrency: usize,
    /// Expected vector dimension; mismatching vectors count as embedding failures.
    pub embedding_dimension: Option<usize>,
    /// Unembedded fraction above which clustering is reported as degraded.
    pub degraded_ratio: f32,
    /// Largest document accepted by upload intake.
    pub max_upload_bytes: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            cluster: ClusterSettings::default(),
            embedding_concurrency: DEFAULT_EMBEDDING_CONCURRENCY,
            embedding_dimension: None,
            degraded_ratio: DEFAULT_DEGRADED_RATIO,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingVariable(key.to_string()))
    }

    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.optional(key)
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(key.to_string()))
            })
            .transpose()
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "hashing" => Ok(Self::Hashing),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, if [`init_config`] has run.
pub fn get_config() -> Option<&'static Config> {
    CONFIG.get()
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() -> Result<&'static Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        ollama_url = %config.ollama_url,
        extraction_model = %config.extraction_model,
        embedding_provider = ?config.embedding_provider,
        embedding_model = %config.embedding_model,
        threshold = config.cluster_similarity_threshold,
        "Loaded configuration"
    );
    Ok(CONFIG.get_or_init(|| config))
}
