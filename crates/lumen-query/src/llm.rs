//! OpenAI-compatible chat client with Server-Sent Events streaming.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use lumen_core::{with_backoff, LlmConfig, LumenError, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::prompt::SYSTEM_PROMPT;

/// A stream of completion text fragments.
pub type FragmentStream = BoxStream<'static, Result<String, LumenError>>;

/// A chat model that can answer a prompt whole or as a stream.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier.
    fn model(&self) -> &str;

    /// The full completion for `prompt`.
    async fn complete(&self, prompt: &str) -> Result<String, LumenError>;

    /// Open a streaming completion for `prompt`.
    ///
    /// Errors before the first fragment are returned directly; later ones
    /// arrive as the stream's final item.
    async fn stream(&self, prompt: &str) -> Result<FragmentStream, LumenError>;
}

/// A message in a chat conversation with the LLM.
///
/// # Examples
///
/// ```
/// use lumen_query::llm::{ChatMessage, Role};
///
/// let msg = ChatMessage {
///     role: Role::User,
///     content: "Explain the retry loop".into(),
/// };
/// assert!(matches!(msg.role, Role::User));
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: Role,
    /// Text content of the message.
    pub content: String,
}

/// Role in the chat conversation.
///
/// # Examples
///
/// ```
/// use lumen_query::llm::Role;
///
/// assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions.
    System,
    /// User input.
    User,
    /// Assistant response.
    Assistant,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Chat backends, by the base URL and key lookup they need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatProvider {
    OpenAi,
    Ollama,
}

impl ChatProvider {
    fn parse(name: &str) -> Result<Self, LumenError> {
        match name.to_lowercase().as_str() {
            "openai" => Ok(ChatProvider::OpenAi),
            "ollama" => Ok(ChatProvider::Ollama),
            other => Err(LumenError::Config(format!(
                "unknown llm provider '{other}' (expected openai or ollama)"
            ))),
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            ChatProvider::OpenAi => "https://api.openai.com",
            ChatProvider::Ollama => "http://localhost:11434",
        }
    }

    /// Environment variable holding the key, for providers that need one.
    fn key_var(self) -> Option<&'static str> {
        match self {
            ChatProvider::OpenAi => Some("OPENAI_API_KEY"),
            ChatProvider::Ollama => None,
        }
    }
}

/// OpenAI-compatible chat completions client.
///
/// Works with any provider that exposes the `/v1/chat/completions` endpoint:
/// OpenAI, Ollama, vLLM, LiteLLM, etc.
///
/// # Examples
///
/// ```
/// use lumen_core::{LlmConfig, RetryPolicy};
/// use lumen_query::llm::{LanguageModel, LlmClient};
///
/// let config = LlmConfig {
///     api_key: Some("test-key".into()),
///     ..LlmConfig::default()
/// };
/// let client = LlmClient::new(&config, RetryPolicy::none()).unwrap();
/// assert_eq!(client.model(), "gpt-4o-mini");
/// ```
pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
    base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("model", &self.config.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl LlmClient {
    /// Create a new LLM client from configuration.
    ///
    /// `provider` picks the default base URL. For `openai` the API key falls
    /// back to `OPENAI_API_KEY`; a local Ollama needs no key.
    ///
    /// # Errors
    ///
    /// Returns [`LumenError::Config`] for an unknown provider, or
    /// [`LumenError::Llm`] if the HTTP client cannot be built.
    pub fn new(config: &LlmConfig, retry: RetryPolicy) -> Result<Self, LumenError> {
        let provider = ChatProvider::parse(&config.provider)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| LumenError::Llm(format!("failed to create HTTP client: {e}")))?;
        let api_key = config
            .api_key
            .clone()
            .or_else(|| provider.key_var().and_then(|var| std::env::var(var).ok()));
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(provider.default_base_url())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client,
            config: config.clone(),
            base_url,
            api_key,
            retry,
        })
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn request<'a>(&'a self, prompt: &str, stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: Role::User,
                    content: prompt.to_string(),
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream,
        }
    }

    /// Send `body` and return the response once its status is a success.
    async fn send(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response, LumenError> {
        let mut request = self.client.post(self.url()).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = request.send().await.map_err(|e| LumenError::Network {
            service: "llm".into(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(LumenError::from_status("llm", status.as_u16(), &body_text));
        }
        Ok(response)
    }

    /// One non-streaming completion attempt.
    async fn complete_once(&self, body: &ChatRequest<'_>) -> Result<String, LumenError> {
        let response = self.send(body).await?;
        let bytes = response.bytes().await.map_err(|e| LumenError::Network {
            service: "llm".into(),
            message: format!("failed to read response body: {e}"),
        })?;
        let parsed: ChatResponse = serde_json::from_slice(&bytes)
            .map_err(|e| LumenError::InvalidResponse(format!("failed to parse completion: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LumenError::InvalidResponse("completion has no content".into()))
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, LumenError> {
        let body = self.request(prompt, false);
        with_backoff(&self.retry, "llm", || self.complete_once(&body)).await
    }

    async fn stream(&self, prompt: &str) -> Result<FragmentStream, LumenError> {
        let body = self.request(prompt, true);
        let response = with_backoff(&self.retry, "llm-stream", || self.send(&body)).await?;
        debug!(model = %self.config.model, "completion stream opened");
        let chunks = response.bytes_stream().map(|chunk| {
            chunk.map(|b| b.to_vec()).map_err(|e| LumenError::Network {
                service: "llm".into(),
                message: format!("stream interrupted: {e}"),
            })
        });
        Ok(decode_fragments(chunks))
    }
}

/// One event extracted from a Server-Sent Events body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Payload of a `data:` line.
    Data(String),
    /// The `[DONE]` terminator.
    Done,
}

/// Incremental SSE line decoder.
///
/// Bytes may be split anywhere by the network, including inside a UTF-8
/// sequence; only complete lines are decoded.
///
/// # Examples
///
/// ```
/// use lumen_query::llm::{SseDecoder, SseEvent};
///
/// let mut decoder = SseDecoder::default();
/// assert!(decoder.push(b"data: {\"a\"").is_empty());
/// assert_eq!(decoder.push(b":1}\n\n"), vec![SseEvent::Data("{\"a\":1}".into())]);
/// assert_eq!(decoder.push(b"data: [DONE]\n"), vec![SseEvent::Done]);
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed a network chunk, returning the events of every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Decode whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest).into_iter().collect()
    }
}

fn parse_line(line: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload == "[DONE]" {
        Some(SseEvent::Done)
    } else if payload.is_empty() {
        None
    } else {
        Some(SseEvent::Data(payload.to_string()))
    }
}

struct DecodeState {
    body: BoxStream<'static, Result<Vec<u8>, LumenError>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String, LumenError>>,
    finished: bool,
}

impl DecodeState {
    fn absorb(&mut self, events: Vec<SseEvent>) {
        for event in events {
            if self.finished {
                return;
            }
            match event {
                SseEvent::Done => self.finished = true,
                SseEvent::Data(payload) => match serde_json::from_str::<StreamChunk>(&payload) {
                    Ok(chunk) => {
                        let text: String = chunk
                            .choices
                            .into_iter()
                            .filter_map(|c| c.delta.content)
                            .collect();
                        if !text.is_empty() {
                            self.pending.push_back(Ok(text));
                        }
                    }
                    Err(e) => {
                        self.pending.push_back(Err(LumenError::InvalidResponse(format!(
                            "malformed stream event: {e}"
                        ))));
                        self.finished = true;
                    }
                },
            }
        }
    }
}

/// Turn a chat-completions SSE body into content fragments.
///
/// The stream ends at `[DONE]`, at the end of the body, or right after the
/// first error item.
pub fn decode_fragments<S>(body: S) -> FragmentStream
where
    S: Stream<Item = Result<Vec<u8>, LumenError>> + Send + 'static,
{
    let state = DecodeState {
        body: body.boxed(),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.push(&chunk);
                    state.absorb(events);
                }
                Some(Err(e)) => {
                    state.pending.push_back(Err(e));
                    state.finished = true;
                }
                None => {
                    let events = state.decoder.finish();
                    state.absorb(events);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"index": 0, "delta": {"content": text}}]})
        )
    }

    async fn collect(chunks: Vec<Result<Vec<u8>, LumenError>>) -> Vec<Result<String, LumenError>> {
        decode_fragments(stream::iter(chunks)).collect().await
    }

    #[test]
    fn request_serializes_with_system_prompt() {
        let config = LlmConfig {
            max_tokens: Some(256),
            ..LlmConfig::default()
        };
        let client = LlmClient::new(&config, RetryPolicy::none()).unwrap();
        let json = serde_json::to_value(client.request("what does auth do?", true)).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "what does auth do?");
        assert_eq!(json["max_tokens"], 256);
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn url_tolerates_trailing_slash() {
        let config = LlmConfig {
            base_url: Some("http://localhost:11434/".into()),
            ..LlmConfig::default()
        };
        let client = LlmClient::new(&config, RetryPolicy::none()).unwrap();
        assert_eq!(client.url(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn provider_selects_default_base_url() {
        let config = LlmConfig {
            provider: "ollama".into(),
            ..LlmConfig::default()
        };
        let client = LlmClient::new(&config, RetryPolicy::none()).unwrap();
        assert_eq!(client.url(), "http://localhost:11434/v1/chat/completions");
        assert!(client.api_key.is_none());

        let client = LlmClient::new(&LlmConfig::default(), RetryPolicy::none()).unwrap();
        assert_eq!(client.url(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn unknown_provider_is_config_error() {
        let config = LlmConfig {
            provider: "anthropic-direct".into(),
            ..LlmConfig::default()
        };
        let err = LlmClient::new(&config, RetryPolicy::none()).unwrap_err();
        assert!(matches!(err, LumenError::Config(_)));
    }

    #[test]
    fn decoder_ignores_comments_and_other_fields() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b": keep-alive\nevent: message\r\ndata: {\"x\":1}\r\n\r\n");
        assert_eq!(events, vec![SseEvent::Data("{\"x\":1}".into())]);
    }

    #[test]
    fn decoder_handles_split_utf8() {
        let line = "data: {\"t\":\"caf\u{e9}\"}\n".as_bytes();
        let split = line.len() - 4;
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&line[..split]).is_empty());
        assert_eq!(
            decoder.push(&line[split..]),
            vec![SseEvent::Data("{\"t\":\"caf\u{e9}\"}".into())]
        );
    }

    #[test]
    fn decoder_flushes_unterminated_last_line() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), vec![SseEvent::Done]);
    }

    #[tokio::test]
    async fn fragments_arrive_in_order_across_chunk_boundaries() {
        let body = format!("{}{}{}data: [DONE]\n\n", delta("The "), delta("store "), delta("persists."));
        let bytes = body.into_bytes();
        let chunks = bytes.chunks(7).map(|c| Ok(c.to_vec())).collect();
        let texts: Vec<String> = collect(chunks).await.into_iter().map(Result::unwrap).collect();
        assert_eq!(texts, vec!["The ", "store ", "persists."]);
    }

    #[tokio::test]
    async fn nothing_after_done_is_yielded() {
        let body = format!("{}data: [DONE]\n\n{}", delta("a"), delta("b"));
        let items = collect(vec![Ok(body.into_bytes())]).await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn transport_error_ends_the_stream() {
        let items = collect(vec![
            Ok(delta("partial").into_bytes()),
            Err(LumenError::Network {
                service: "llm".into(),
                message: "reset".into(),
            }),
            Ok(delta("never").into_bytes()),
        ])
        .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        assert!(matches!(items[1], Err(LumenError::Network { .. })));
    }

    #[tokio::test]
    async fn malformed_event_is_invalid_response() {
        let items = collect(vec![Ok(b"data: {not json\n\n".to_vec())]).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(LumenError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn role_only_deltas_are_skipped() {
        let body = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n".to_string() + &delta("hi");
        let items = collect(vec![Ok(body.into_bytes())]).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), "hi");
    }
}
