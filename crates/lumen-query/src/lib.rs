//! Query pipeline for Lumen: retrieval, prompt rendering, and LLM analysis.
//!
//! - [`llm`]: the [`LanguageModel`] seam and an OpenAI-compatible client
//!   with Server-Sent Events streaming
//! - [`prompt`]: semantic and code-pattern prompt templates
//! - [`pipeline`]: [`QueryProcessor`] and [`StreamQueryProcessor`]

pub mod llm;
pub mod pipeline;
pub mod prompt;

pub use llm::{LanguageModel, LlmClient};
pub use pipeline::{QueryPhase, QueryProcessor, StreamQueryProcessor};
pub use prompt::{provider_for, render_prompts, PromptProvider, RenderedPrompt};
