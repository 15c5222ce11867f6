//! Remote embedding providers.
//!
//! [`EmbeddingClient`] speaks the `/embeddings` endpoint shared by Voyage AI
//! and OpenAI. Voyage additionally receives `input_type: "document"` for
//! indexing and `input_type: "query"` for searching.

use std::time::Duration;

use async_trait::async_trait;
use lumen_core::{with_backoff, EmbeddingConfig, LumenError, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Anything that turns text into fixed-length vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed `texts`, returning one vector per text in the same order.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LumenError>;

    /// Embed a search query.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, LumenError>;

    /// Model identifier.
    fn model(&self) -> &str;

    /// Texts sent per request.
    fn batch_size(&self) -> usize;

    /// Length of the returned vectors.
    fn dimension(&self) -> usize;
}

/// Supported embedding APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Voyage AI.
    Voyage,
    /// OpenAI or any compatible server.
    OpenAi,
}

impl Provider {
    fn parse(name: &str) -> Result<Self, LumenError> {
        match name.to_lowercase().as_str() {
            "voyage" => Ok(Provider::Voyage),
            "openai" => Ok(Provider::OpenAi),
            other => Err(LumenError::Config(format!(
                "unknown embedding provider '{other}' (expected voyage or openai)"
            ))),
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Provider::Voyage => "https://api.voyageai.com/v1",
            Provider::OpenAi => "https://api.openai.com/v1",
        }
    }

    fn key_var(self) -> &'static str {
        match self {
            Provider::Voyage => "VOYAGE_API_KEY",
            Provider::OpenAi => "OPENAI_API_KEY",
        }
    }

    fn input_type(self, kind: InputKind) -> Option<&'static str> {
        match (self, kind) {
            (Provider::Voyage, InputKind::Document) => Some("document"),
            (Provider::Voyage, InputKind::Query) => Some("query"),
            (Provider::OpenAi, _) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum InputKind {
    Document,
    Query,
}

const BATCH_DELAY_MS: u64 = 200;
const REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    input_type: Option<&'static str>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDataItem>,
}

#[derive(Deserialize)]
struct EmbedDataItem {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

/// HTTP client for the Voyage / OpenAI embedding APIs.
///
/// # Examples
///
/// ```
/// use lumen_index::embedding::{EmbeddingClient, EmbeddingProvider};
///
/// let client = EmbeddingClient::new("test-key");
/// assert_eq!(client.model(), "voyage-code-3");
/// assert_eq!(client.batch_size(), 64);
/// ```
pub struct EmbeddingClient {
    client: reqwest::Client,
    provider: Provider,
    api_key: String,
    base_url: String,
    model: String,
    batch_size: usize,
    dimension: usize,
    retry: RetryPolicy,
}

impl std::fmt::Debug for EmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl EmbeddingClient {
    /// Create a Voyage client with default settings and the given API key.
    pub fn new(api_key: &str) -> Self {
        let defaults = EmbeddingConfig::default();
        Self {
            client: build_http_client(),
            provider: Provider::Voyage,
            api_key: api_key.to_string(),
            base_url: Provider::Voyage.default_base_url().to_string(),
            model: defaults.model,
            batch_size: defaults.batch_size,
            dimension: defaults.dimension,
            retry: RetryPolicy::default(),
        }
    }

    /// Create a client from an [`EmbeddingConfig`].
    ///
    /// Falls back to `VOYAGE_API_KEY` or `OPENAI_API_KEY` when the config
    /// has no key.
    ///
    /// # Errors
    ///
    /// Returns [`LumenError::Config`] for an unknown provider or a missing key.
    ///
    /// # Examples
    ///
    /// ```
    /// use lumen_core::{EmbeddingConfig, RetryPolicy};
    /// use lumen_index::embedding::{EmbeddingClient, EmbeddingProvider};
    ///
    /// let config = EmbeddingConfig {
    ///     provider: "openai".into(),
    ///     api_key: Some("sk-test".into()),
    ///     model: "text-embedding-3-small".into(),
    ///     dimension: 1536,
    ///     ..EmbeddingConfig::default()
    /// };
    /// let client = EmbeddingClient::with_config(&config, RetryPolicy::none()).unwrap();
    /// assert_eq!(client.dimension(), 1536);
    /// ```
    pub fn with_config(config: &EmbeddingConfig, retry: RetryPolicy) -> Result<Self, LumenError> {
        let provider = Provider::parse(&config.provider)?;
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(provider.key_var()).ok())
            .ok_or_else(|| {
                LumenError::Config(format!(
                    "embedding API key not found: set embedding.api_key in .lumen.toml or {} env var",
                    provider.key_var()
                ))
            })?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| provider.default_base_url().to_string());

        Ok(Self {
            client: build_http_client(),
            provider,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            batch_size: config.batch_size.max(1),
            dimension: config.dimension,
            retry,
        })
    }

    /// Send one request of at most `batch_size` texts, with retries.
    async fn embed_batch(
        &self,
        batch: &[String],
        kind: InputKind,
    ) -> Result<Vec<Vec<f32>>, LumenError> {
        let request = EmbedRequest {
            model: &self.model,
            input: batch,
            input_type: self.provider.input_type(kind),
        };
        with_backoff(&self.retry, "embedding", || self.send(&request, batch.len())).await
    }

    async fn send(
        &self,
        request: &EmbedRequest<'_>,
        expected: usize,
    ) -> Result<Vec<Vec<f32>>, LumenError> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .map_err(|e| LumenError::Network {
                service: "embedding".into(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| LumenError::Network {
            service: "embedding".into(),
            message: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(LumenError::from_status(
                "embedding",
                status.as_u16(),
                &String::from_utf8_lossy(&body),
            ));
        }

        let parsed: EmbedResponse = serde_json::from_slice(&body).map_err(|e| {
            LumenError::InvalidResponse(format!("failed to parse embedding response: {e}"))
        })?;
        order_embeddings(parsed.data, expected)
    }
}

/// Sort items by their `index` field when present and check the count.
fn order_embeddings(
    mut items: Vec<EmbedDataItem>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, LumenError> {
    if items.len() != expected {
        return Err(LumenError::InvalidResponse(format!(
            "expected {expected} embeddings, got {}",
            items.len()
        )));
    }
    if items.iter().all(|item| item.index.is_some()) {
        items.sort_by_key(|item| item.index);
        let in_range = items
            .iter()
            .enumerate()
            .all(|(pos, item)| item.index == Some(pos));
        if !in_range {
            return Err(LumenError::InvalidResponse(
                "embedding indices are not a permutation of the input".into(),
            ));
        }
    }
    Ok(items.into_iter().map(|item| item.embedding).collect())
}

fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[async_trait]
impl EmbeddingProvider for EmbeddingClient {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LumenError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all_embeddings = Vec::with_capacity(texts.len());
        for (i, batch) in texts.chunks(self.batch_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(BATCH_DELAY_MS)).await;
            }
            debug!(batch = i, size = batch.len(), model = %self.model, "embedding batch");
            let embeddings = self
                .embed_batch(batch, InputKind::Document)
                .await
                .inspect_err(|e| error!(batch = i, error = %e, "embedding batch failed"))?;
            all_embeddings.extend(embeddings);
        }
        Ok(all_embeddings)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, LumenError> {
        let input = [text.to_string()];
        let mut embeddings = self.embed_batch(&input, InputKind::Query).await?;
        embeddings
            .pop()
            .ok_or_else(|| LumenError::InvalidResponse("empty embedding response".into()))
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(embedding: Vec<f32>, index: Option<usize>) -> EmbedDataItem {
        EmbedDataItem { embedding, index }
    }

    #[test]
    fn voyage_request_carries_input_type() {
        let input = vec!["fn main() {}".to_string(), "struct Foo {}".to_string()];
        let request = EmbedRequest {
            model: "voyage-code-3",
            input: &input,
            input_type: Provider::Voyage.input_type(InputKind::Document),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "voyage-code-3");
        assert_eq!(json["input_type"], "document");
        assert_eq!(json["input"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn openai_request_omits_input_type() {
        let input = vec!["auth logic".to_string()];
        let request = EmbedRequest {
            model: "text-embedding-3-small",
            input: &input,
            input_type: Provider::OpenAi.input_type(InputKind::Query),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("input_type").is_none());
    }

    #[test]
    fn response_parsing_works() {
        let json = r#"{
            "object": "list",
            "data": [
                {"embedding": [0.1, 0.2, 0.3], "index": 0},
                {"embedding": [0.4, 0.5, 0.6], "index": 1}
            ],
            "model": "voyage-code-3"
        }"#;
        let response: EmbedResponse = serde_json::from_str(json).unwrap();
        let vectors = order_embeddings(response.data, 2).unwrap();
        assert_eq!(vectors[0], vec![0.1, 0.2, 0.3]);
        assert_eq!(vectors[1], vec![0.4, 0.5, 0.6]);
    }

    #[test]
    fn items_are_reordered_by_index() {
        let items = vec![item(vec![2.0], Some(2)), item(vec![0.0], Some(0)), item(vec![1.0], Some(1))];
        let vectors = order_embeddings(items, 3).unwrap();
        assert_eq!(vectors, vec![vec![0.0], vec![1.0], vec![2.0]]);
    }

    #[test]
    fn count_mismatch_is_invalid_response() {
        let err = order_embeddings(vec![item(vec![1.0], None)], 2).unwrap_err();
        assert!(matches!(err, LumenError::InvalidResponse(_)));
    }

    #[test]
    fn duplicate_indices_are_invalid_response() {
        let items = vec![item(vec![1.0], Some(0)), item(vec![2.0], Some(0))];
        assert!(matches!(
            order_embeddings(items, 2),
            Err(LumenError::InvalidResponse(_))
        ));
    }

    #[test]
    fn unknown_provider_is_config_error() {
        let config = EmbeddingConfig {
            provider: "cohere".into(),
            api_key: Some("k".into()),
            ..EmbeddingConfig::default()
        };
        assert!(matches!(
            EmbeddingClient::with_config(&config, RetryPolicy::none()),
            Err(LumenError::Config(_))
        ));
    }

    #[test]
    fn missing_api_key_gives_clear_error() {
        std::env::remove_var("VOYAGE_API_KEY");
        let config = EmbeddingConfig {
            api_key: None,
            ..EmbeddingConfig::default()
        };
        let err = EmbeddingClient::with_config(&config, RetryPolicy::none())
            .unwrap_err()
            .to_string();
        assert!(err.contains("VOYAGE_API_KEY"), "error should name the env var: {err}");
    }
}
