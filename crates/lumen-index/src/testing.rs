//! Deterministic, offline embedding provider for tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use lumen_core::LumenError;

use crate::embedding::EmbeddingProvider;

/// Bag-of-words embedder: every token is hashed into one of
/// [`KeywordEmbedder::DIMENSION`] buckets.
///
/// Texts sharing words land close together, identical texts land on the
/// same point. Counts how many texts and queries it embedded.
///
/// # Examples
///
/// ```
/// use lumen_index::embedding::EmbeddingProvider;
/// use lumen_index::testing::KeywordEmbedder;
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let embedder = KeywordEmbedder::default();
/// let a = embedder.embed_query("parse config file").await.unwrap();
/// let b = embedder.embed_query("parse config file").await.unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.len(), KeywordEmbedder::DIMENSION);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct KeywordEmbedder {
    texts: AtomicUsize,
    queries: AtomicUsize,
    fail: bool,
}

impl KeywordEmbedder {
    /// Vector length produced.
    pub const DIMENSION: usize = 16;

    /// An embedder whose every call fails with [`LumenError::Auth`].
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Number of document texts embedded so far.
    pub fn embedded_texts(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    /// Number of queries embedded so far.
    pub fn embedded_queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// The vector for `text`.
    pub fn vector_for(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; Self::DIMENSION];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[bucket(&token.to_lowercase())] += 1.0;
        }
        vector
    }

    fn check(&self) -> Result<(), LumenError> {
        if self.fail {
            return Err(LumenError::Auth {
                service: "embedding".into(),
                message: "HTTP 401: invalid api key".into(),
            });
        }
        Ok(())
    }
}

fn bucket(token: &str) -> usize {
    // FNV-1a
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % KeywordEmbedder::DIMENSION as u64) as usize
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LumenError> {
        self.check()?;
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, LumenError> {
        self.check()?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(Self::vector_for(text))
    }

    fn model(&self) -> &str {
        "keyword-hash"
    }

    fn batch_size(&self) -> usize {
        32
    }

    fn dimension(&self) -> usize {
        Self::DIMENSION
    }
}
