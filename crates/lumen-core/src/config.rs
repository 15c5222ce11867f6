use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LumenError;
use crate::retry::RetryPolicy;
use crate::types::{PromptProviderType, PromptType, StoreType};

/// Top-level configuration loaded from `.lumen.toml`.
///
/// Every section is optional; missing keys fall back to their defaults.
///
/// # Examples
///
/// ```
/// use lumen_core::LumenConfig;
///
/// let config = LumenConfig::default();
/// assert_eq!(config.query.max_results, 10);
/// assert_eq!(config.embedding.dimension, 1024);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LumenConfig {
    /// Embedding provider settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Vector store settings.
    #[serde(default)]
    pub store: VectorStoreConfig,
    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Query pipeline settings.
    #[serde(default)]
    pub query: QueryConfig,
    /// Backoff applied at the HTTP client boundaries.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl LumenConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LumenError::Io`] if the file cannot be read, or
    /// [`LumenError::Toml`] if the content is not valid TOML.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use lumen_core::LumenConfig;
    /// use std::path::Path;
    ///
    /// let config = LumenConfig::from_file(Path::new(".lumen.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, LumenError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`LumenError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use lumen_core::{LumenConfig, StoreType};
    ///
    /// let toml = r#"
    /// [store]
    /// store_type = "relational-vector"
    ///
    /// [query]
    /// max_results = 4
    /// "#;
    /// let config = LumenConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.store.store_type, StoreType::RelationalVector);
    /// assert_eq!(config.query.max_results, 4);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, LumenError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`LumenError::Config`] naming the first offending field.
    ///
    /// # Examples
    ///
    /// ```
    /// use lumen_core::LumenConfig;
    ///
    /// let mut config = LumenConfig::default();
    /// config.store.dimension = Some(768);
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), LumenError> {
        if self.embedding.batch_size == 0 {
            return Err(LumenError::Config("embedding.batch_size must be at least 1".into()));
        }
        if self.embedding.dimension == 0 {
            return Err(LumenError::Config("embedding.dimension must be at least 1".into()));
        }
        if let Some(dim) = self.store.dimension {
            if dim != self.embedding.dimension {
                return Err(LumenError::Config(format!(
                    "store.dimension ({dim}) does not match embedding.dimension ({})",
                    self.embedding.dimension
                )));
            }
        }
        if self.query.max_results == 0 {
            return Err(LumenError::Config("query.max_results must be at least 1".into()));
        }
        if self.query.batch_size == 0 {
            return Err(LumenError::Config("query.batch_size must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(LumenError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !matches!(self.llm.provider.to_lowercase().as_str(), "openai" | "ollama") {
            return Err(LumenError::Config(format!(
                "unknown llm.provider '{}' (expected openai or ollama)",
                self.llm.provider
            )));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(LumenError::Config(format!(
                "llm.temperature must be between 0 and 2, got {}",
                self.llm.temperature
            )));
        }
        Ok(())
    }

    /// Dimension the vector store is opened with.
    pub fn effective_dimension(&self) -> usize {
        self.store.dimension.unwrap_or(self.embedding.dimension)
    }
}

/// Embedding provider configuration.
///
/// # Examples
///
/// ```
/// use lumen_core::EmbeddingConfig;
///
/// let config = EmbeddingConfig::default();
/// assert_eq!(config.provider, "voyage");
/// assert_eq!(config.model, "voyage-code-3");
/// assert_eq!(config.batch_size, 64);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider name (`"voyage"` or `"openai"`).
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    /// API key; falls back to the provider's environment variable.
    pub api_key: Option<String>,
    /// Custom base URL for API requests.
    pub base_url: Option<String>,
    /// Embedding model identifier.
    #[serde(default = "default_embedding_model", alias = "model_name")]
    pub model: String,
    /// Texts per request.
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
    /// Length of the vectors the model returns.
    #[serde(default = "default_dimension", alias = "dimensions")]
    pub dimension: usize,
}

fn default_embedding_provider() -> String {
    "voyage".into()
}

fn default_embedding_model() -> String {
    "voyage-code-3".into()
}

fn default_embedding_batch_size() -> usize {
    64
}

fn default_dimension() -> usize {
    1024
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            base_url: None,
            model: default_embedding_model(),
            batch_size: default_embedding_batch_size(),
            dimension: default_dimension(),
        }
    }
}

/// Vector store configuration.
///
/// # Examples
///
/// ```
/// use lumen_core::{StoreType, VectorStoreConfig};
///
/// let config = VectorStoreConfig::default();
/// assert_eq!(config.store_type, StoreType::InMemoryIndex);
/// assert!(config.dimension.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    /// Backend selection.
    #[serde(default)]
    pub store_type: StoreType,
    /// Vector dimension; defaults to the embedding dimension.
    pub dimension: Option<usize>,
    /// Directory the backend persists into. `None` keeps the store in memory.
    ///
    /// In TOML an omitted key means `.lumen/index` and an empty string means
    /// memory only.
    #[serde(
        default = "default_persist_location",
        deserialize_with = "empty_path_as_none"
    )]
    pub persist_location: Option<PathBuf>,
}

fn default_persist_location() -> Option<PathBuf> {
    Some(PathBuf::from(".lumen/index"))
}

fn empty_path_as_none<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let path = PathBuf::deserialize(deserializer)?;
    Ok((!path.as_os_str().is_empty()).then_some(path))
}

impl VectorStoreConfig {
    /// An unpersisted store of the given type.
    pub fn in_memory(store_type: StoreType, dimension: usize) -> Self {
        Self {
            store_type,
            dimension: Some(dimension),
            persist_location: None,
        }
    }

    /// A store persisted under `dir`.
    pub fn persisted(store_type: StoreType, dimension: usize, dir: impl Into<PathBuf>) -> Self {
        Self {
            store_type,
            dimension: Some(dimension),
            persist_location: Some(dir.into()),
        }
    }
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::default(),
            dimension: None,
            persist_location: default_persist_location(),
        }
    }
}

/// LLM provider configuration.
///
/// # Examples
///
/// ```
/// use lumen_core::LlmConfig;
///
/// let config = LlmConfig::default();
/// assert_eq!(config.model, "gpt-4o-mini");
/// assert_eq!(config.temperature, 0.7);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name: `"openai"` or `"ollama"`. Picks the default base URL
    /// and API key variable; any OpenAI-compatible server works as `openai`
    /// with a `base_url`.
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    /// Model identifier.
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// API key; falls back to `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    /// Custom base URL for API requests.
    pub base_url: Option<String>,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Upper bound on completion tokens.
    pub max_tokens: Option<u32>,
}

fn default_llm_provider() -> String {
    "openai".into()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".into()
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_key: None,
            base_url: None,
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

/// Query pipeline configuration.
///
/// # Examples
///
/// ```
/// use lumen_core::{PromptType, QueryConfig};
///
/// let config = QueryConfig::default();
/// assert_eq!(config.max_results, 10);
/// assert_eq!(config.batch_size, 5);
/// assert_eq!(config.prompt_type, PromptType::Aggregate);
/// assert!(config.min_score.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Results kept after ranking.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Results per LLM batch.
    #[serde(default = "default_query_batch_size")]
    pub batch_size: usize,
    /// Prompt granularity.
    #[serde(default)]
    pub prompt_type: PromptType,
    /// Prompt phrasing.
    #[serde(default)]
    pub prompt_provider: PromptProviderType,
    /// Results scoring below this are dropped before batching.
    pub min_score: Option<f64>,
}

fn default_max_results() -> usize {
    10
}

fn default_query_batch_size() -> usize {
    5
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            batch_size: default_query_batch_size(),
            prompt_type: PromptType::default(),
            prompt_provider: PromptProviderType::default(),
            min_score: None,
        }
    }
}

/// Backoff settings for remote calls.
///
/// # Examples
///
/// ```
/// use lumen_core::RetryConfig;
///
/// let policy = RetryConfig::default().to_policy();
/// assert_eq!(policy.max_attempts, 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    4000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl RetryConfig {
    /// Convert to the policy consumed by [`crate::retry::with_backoff`].
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}
