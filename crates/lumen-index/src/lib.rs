//! Embedding generation and vector storage.
//!
//! - [`embedding`]: the [`EmbeddingProvider`] contract and an HTTP client for
//!   Voyage AI and OpenAI-compatible APIs, with batching and backoff
//! - [`store`]: the [`VectorStore`] contract and its flat, document, and
//!   SQLite backends
//! - [`manager`]: [`EmbeddingManager`], which ties a provider to a store

pub mod embedding;
pub mod manager;
pub mod store;
pub mod testing;

pub use embedding::{EmbeddingClient, EmbeddingProvider};
pub use manager::{content_id, EmbeddingManager};
pub use store::{AnyStore, VectorStore};
