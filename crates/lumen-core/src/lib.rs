//! Core types, configuration, and error handling for Lumen.
//!
//! This crate provides the shared foundation used by the other Lumen crates:
//! - [`LumenError`]: unified error type using `thiserror`
//! - [`LumenConfig`]: configuration loaded from `.lumen.toml`
//! - [`with_backoff`]: bounded exponential retry for remote calls
//! - Shared types: [`EmbeddingVector`], [`SearchResult`], [`MetadataFilter`],
//!   [`AnalysisResult`], [`StreamFragment`], [`StoreStats`]

mod config;
mod error;
pub mod retry;
mod types;

pub use config::{
    EmbeddingConfig, LlmConfig, LumenConfig, QueryConfig, RetryConfig, VectorStoreConfig,
};
pub use error::LumenError;
pub use retry::{with_backoff, RetryPolicy};
pub use types::{
    rank_results, source_metadata, AnalysisResult, EmbeddingVector, FilterCondition, Metadata,
    MetadataFilter, MetadataValue, OutputFormat, PromptProviderType, PromptType, SearchResult,
    StoreStats, StoreType, StreamFragment, SOURCE_KEY, UNKNOWN_SOURCE,
};

/// A convenience `Result` type for Lumen operations.
pub type Result<T> = std::result::Result<T, LumenError>;
