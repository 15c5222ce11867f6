//! Binds one embedding provider to one vector store.

use std::collections::HashSet;
use std::sync::Arc;

use lumen_core::{
    EmbeddingVector, LumenError, Metadata, MetadataFilter, SearchResult, StoreStats, SOURCE_KEY,
};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::embedding::EmbeddingProvider;
use crate::store::VectorStore;

/// Stable id of a chunk: hex SHA-256 of `source`, a NUL byte, then `text`.
///
/// # Examples
///
/// ```
/// use lumen_index::manager::content_id;
///
/// let id = content_id("src/lib.rs", "pub fn f() {}");
/// assert_eq!(id.len(), 64);
/// assert_eq!(id, content_id("src/lib.rs", "pub fn f() {}"));
/// assert_ne!(id, content_id("src/main.rs", "pub fn f() {}"));
/// ```
pub fn content_id(source: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Adds texts to a store and searches it by natural-language query.
///
/// Adds are idempotent: a chunk whose content-hash id is already stored is
/// neither re-embedded nor duplicated.
#[derive(Clone)]
pub struct EmbeddingManager {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
}

impl std::fmt::Debug for EmbeddingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingManager")
            .field("model", &self.provider.model())
            .field("dimension", &self.store.dimension())
            .finish_non_exhaustive()
    }
}

impl EmbeddingManager {
    /// Bind `provider` to `store`.
    ///
    /// # Errors
    ///
    /// Returns [`LumenError::DimensionMismatch`] if they disagree on the
    /// vector dimension.
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self, LumenError> {
        if provider.dimension() != store.dimension() {
            return Err(LumenError::DimensionMismatch {
                expected: store.dimension(),
                actual: provider.dimension(),
            });
        }
        Ok(Self { provider, store })
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Embed and store `texts`, returning one id per text in input order.
    ///
    /// `metadatas`, when given, must have one entry per text. Its `source`
    /// key feeds the content-hash id.
    ///
    /// # Errors
    ///
    /// Returns [`LumenError::InvalidInput`] on a length mismatch, and passes
    /// provider and store errors through unchanged.
    pub async fn add_texts(
        &self,
        texts: &[String],
        metadatas: Option<&[Metadata]>,
    ) -> Result<Vec<String>, LumenError> {
        if let Some(m) = metadatas {
            if m.len() != texts.len() {
                return Err(LumenError::InvalidInput(format!(
                    "{} texts but {} metadata entries",
                    texts.len(),
                    m.len()
                )));
            }
        }

        let mut ids = Vec::with_capacity(texts.len());
        let mut seen = HashSet::new();
        let mut fresh_texts = Vec::new();
        let mut fresh = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            let metadata = metadatas.map(|m| m[i].clone()).unwrap_or_default();
            let source = metadata
                .get(SOURCE_KEY)
                .map(|s| s.to_string())
                .unwrap_or_default();
            let id = content_id(&source, text);
            ids.push(id.clone());
            if !seen.insert(id.clone()) {
                continue;
            }
            let stored = self
                .store
                .contains(&id)
                .inspect_err(|e| error!(error = %e, "store lookup failed during add"))?;
            if stored {
                continue;
            }
            fresh_texts.push(text.clone());
            fresh.push((id, metadata));
        }

        let skipped = texts.len() - fresh.len();
        if fresh.is_empty() {
            debug!(skipped, "all texts already stored");
            return Ok(ids);
        }

        let embeddings = self
            .provider
            .embed_documents(&fresh_texts)
            .await
            .inspect_err(|e| {
                error!(
                    texts = fresh_texts.len(),
                    model = self.provider.model(),
                    error = %e,
                    "embedding documents failed"
                )
            })?;
        if embeddings.len() != fresh.len() {
            let err = LumenError::InvalidResponse(format!(
                "provider returned {} embeddings for {} texts",
                embeddings.len(),
                fresh.len()
            ));
            error!(error = %err, "embedding documents failed");
            return Err(err);
        }

        let vectors: Vec<EmbeddingVector> = fresh
            .into_iter()
            .zip(fresh_texts)
            .zip(embeddings)
            .map(|(((id, metadata), text), vector)| EmbeddingVector {
                id,
                vector,
                metadata,
                text: Some(text),
            })
            .collect();
        let added = vectors.len();
        self.store
            .add_vectors(vectors)
            .inspect_err(|e| error!(vectors = added, error = %e, "adding vectors failed"))?;

        info!(added, skipped, "texts embedded and stored");
        Ok(ids)
    }

    /// The `limit` stored chunks closest to `query`, best first.
    ///
    /// Callers that post-filter by score conventionally ask for twice the
    /// number of results they intend to keep.
    ///
    /// # Errors
    ///
    /// Passes provider and store errors through unchanged.
    pub async fn similarity_search(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, LumenError> {
        let embedding = self
            .provider
            .embed_query(query)
            .await
            .inspect_err(|e| error!(error = %e, "embedding query failed"))?;
        let results = self
            .store
            .query(&embedding, limit, filter)
            .inspect_err(|e| error!(limit, error = %e, "vector search failed"))?;
        debug!(limit, found = results.len(), "similarity search done");
        Ok(results)
    }

    /// Remove entries by id, returning how many existed.
    ///
    /// # Errors
    ///
    /// Passes store errors through unchanged.
    pub fn delete_vectors(&self, ids: &[String]) -> Result<usize, LumenError> {
        let removed = self
            .store
            .delete(ids)
            .inspect_err(|e| error!(error = %e, "deleting vectors failed"))?;
        info!(requested = ids.len(), removed, "vectors deleted");
        Ok(removed)
    }

    /// Remove every entry.
    ///
    /// # Errors
    ///
    /// Passes store errors through unchanged.
    pub fn clear(&self) -> Result<(), LumenError> {
        self.store
            .clear()
            .inspect_err(|e| error!(error = %e, "clearing store failed"))?;
        info!("vector store cleared");
        Ok(())
    }

    /// Store summary.
    ///
    /// # Errors
    ///
    /// Passes store errors through unchanged.
    pub fn stats(&self) -> Result<StoreStats, LumenError> {
        self.store
            .stats()
            .inspect_err(|e| error!(error = %e, "reading store stats failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::KeywordEmbedder;
    use crate::store::FlatIndex;
    use lumen_core::source_metadata;

    fn manager(embedder: Arc<KeywordEmbedder>) -> EmbeddingManager {
        EmbeddingManager::new(embedder, Arc::new(FlatIndex::open(KeywordEmbedder::DIMENSION, None)))
            .unwrap()
    }

    #[tokio::test]
    async fn repeated_adds_embed_once() {
        let embedder = Arc::new(KeywordEmbedder::default());
        let manager = manager(embedder.clone());
        let texts = vec!["fn login() {}".to_string(), "fn login() {}".to_string()];
        let metas = vec![source_metadata("auth.rs"), source_metadata("auth.rs")];

        let first = manager.add_texts(&texts, Some(&metas)).await.unwrap();
        let second = manager.add_texts(&texts, Some(&metas)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0], first[1]);
        assert_eq!(manager.stats().unwrap().count, 1);
        assert_eq!(embedder.embedded_texts(), 1);
    }

    #[tokio::test]
    async fn same_text_in_two_files_is_two_entries() {
        let manager = manager(Arc::new(KeywordEmbedder::default()));
        let texts = vec!["fn main() {}".to_string(), "fn main() {}".to_string()];
        let metas = vec![source_metadata("a.rs"), source_metadata("b.rs")];
        let ids = manager.add_texts(&texts, Some(&metas)).await.unwrap();
        assert_ne!(ids[0], ids[1]);
        assert_eq!(manager.stats().unwrap().count, 2);
    }

    #[tokio::test]
    async fn metadata_length_mismatch_is_invalid_input() {
        let manager = manager(Arc::new(KeywordEmbedder::default()));
        let texts = vec!["a".to_string(), "b".to_string()];
        let metas = vec![source_metadata("a.rs")];
        let err = manager.add_texts(&texts, Some(&metas)).await.unwrap_err();
        assert!(matches!(err, LumenError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn dimension_disagreement_is_rejected() {
        let result = EmbeddingManager::new(
            Arc::new(KeywordEmbedder::default()),
            Arc::new(FlatIndex::open(KeywordEmbedder::DIMENSION + 1, None)),
        );
        assert!(matches!(result, Err(LumenError::DimensionMismatch { .. })));
    }

    #[tokio::test]
    async fn provider_failure_passes_through() {
        let embedder = Arc::new(KeywordEmbedder::failing());
        let manager = manager(embedder);
        let err = manager
            .add_texts(&["fn x() {}".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, LumenError::Auth { .. }));
        assert_eq!(manager.stats().unwrap().count, 0);
    }

    #[tokio::test]
    async fn delete_and_clear_delegate() {
        let manager = manager(Arc::new(KeywordEmbedder::default()));
        let ids = manager
            .add_texts(&["login".to_string(), "database".to_string()], None)
            .await
            .unwrap();
        assert_eq!(manager.delete_vectors(&ids[..1]).unwrap(), 1);
        assert_eq!(manager.stats().unwrap().count, 1);
        manager.clear().unwrap();
        assert_eq!(manager.stats().unwrap().count, 0);
    }
}
