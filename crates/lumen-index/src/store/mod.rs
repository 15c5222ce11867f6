//! Nearest-neighbor vector stores.
//!
//! Three backends share the [`VectorStore`] contract. Each one normalizes its
//! native metric so a higher [`SearchResult::score`] always means a closer
//! match:
//!
//! | backend | native metric | score |
//! |---|---|---|
//! | [`FlatIndex`] | squared L2 distance `d` | `1 / (1 + d)` |
//! | [`DocumentStore`] | cosine distance `d` | `1 - d` |
//! | [`SqliteStore`] | cosine similarity | unchanged |

mod document;
mod flat;
mod snapshot;
mod sqlite;

use std::collections::HashMap;

use lumen_core::{
    rank_results, EmbeddingVector, LumenError, MetadataFilter, SearchResult, StoreStats,
    StoreType, VectorStoreConfig,
};
use tracing::info;

pub use document::DocumentStore;
pub use flat::FlatIndex;
pub use sqlite::SqliteStore;

/// Capability interface shared by every vector store backend.
///
/// Implementations are safe to query from several tasks at once; writes are
/// serialized internally.
pub trait VectorStore: Send + Sync {
    /// Insert or replace `vectors`, returning their ids in input order.
    ///
    /// # Errors
    ///
    /// Returns [`LumenError::DimensionMismatch`] and inserts nothing if any
    /// vector has the wrong length.
    fn add_vectors(&self, vectors: Vec<EmbeddingVector>) -> Result<Vec<String>, LumenError>;

    /// The `k` entries closest to `query`, best first, that satisfy `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`LumenError::DimensionMismatch`] if `query` has the wrong length.
    fn query(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, LumenError>;

    /// Remove the given ids, returning how many were present.
    fn delete(&self, ids: &[String]) -> Result<usize, LumenError>;

    /// Remove every entry.
    fn clear(&self) -> Result<(), LumenError>;

    /// Whether an entry with `id` is stored.
    fn contains(&self, id: &str) -> Result<bool, LumenError>;

    /// Number of stored entries.
    fn len(&self) -> Result<usize, LumenError>;

    /// True when the store holds no entries.
    fn is_empty(&self) -> Result<bool, LumenError> {
        Ok(self.len()? == 0)
    }

    /// Fixed vector dimension of this store.
    fn dimension(&self) -> usize;

    /// Summary for display.
    fn stats(&self) -> Result<StoreStats, LumenError>;
}

/// A store of any backend, chosen at runtime from [`VectorStoreConfig`].
///
/// # Examples
///
/// ```
/// use lumen_core::{source_metadata, EmbeddingVector, StoreType, VectorStoreConfig};
/// use lumen_index::store::{AnyStore, VectorStore};
///
/// let config = VectorStoreConfig::in_memory(StoreType::InMemoryIndex, 2);
/// let store = AnyStore::open(&config, 2).unwrap();
/// store
///     .add_vectors(vec![EmbeddingVector {
///         id: "a".into(),
///         vector: vec![1.0, 0.0],
///         metadata: source_metadata("a.rs"),
///         text: Some("fn a() {}".into()),
///     }])
///     .unwrap();
/// let hits = store.query(&[1.0, 0.0], 1, None).unwrap();
/// assert_eq!(hits[0].id, "a");
/// ```
#[derive(Debug)]
pub enum AnyStore {
    /// Flat in-process L2 index.
    Flat(FlatIndex),
    /// Embedded JSON document collection.
    Document(DocumentStore),
    /// SQLite table with embedding BLOBs.
    Sqlite(SqliteStore),
}

impl AnyStore {
    /// Open the backend named by `config`, loading any persisted state.
    ///
    /// `default_dimension` is used when the config does not set one.
    ///
    /// # Errors
    ///
    /// Returns [`LumenError::Config`] for a zero dimension, or
    /// [`LumenError::Database`] if the SQLite backend cannot be opened at all.
    pub fn open(config: &VectorStoreConfig, default_dimension: usize) -> Result<Self, LumenError> {
        let dimension = config.dimension.unwrap_or(default_dimension);
        if dimension == 0 {
            return Err(LumenError::Config("vector dimension must be at least 1".into()));
        }
        let dir = config.persist_location.as_deref();
        let store = match config.store_type {
            StoreType::InMemoryIndex => AnyStore::Flat(FlatIndex::open(dimension, dir)),
            StoreType::EmbeddedDocStore => AnyStore::Document(DocumentStore::open(dimension, dir)),
            StoreType::RelationalVector => AnyStore::Sqlite(SqliteStore::open(dimension, dir)?),
        };
        info!(
            store = %config.store_type,
            dimension,
            persisted = dir.is_some(),
            "vector store opened"
        );
        Ok(store)
    }

    fn inner(&self) -> &dyn VectorStore {
        match self {
            AnyStore::Flat(s) => s,
            AnyStore::Document(s) => s,
            AnyStore::Sqlite(s) => s,
        }
    }
}

impl VectorStore for AnyStore {
    fn add_vectors(&self, vectors: Vec<EmbeddingVector>) -> Result<Vec<String>, LumenError> {
        self.inner().add_vectors(vectors)
    }

    fn query(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, LumenError> {
        self.inner().query(query, k, filter)
    }

    fn delete(&self, ids: &[String]) -> Result<usize, LumenError> {
        self.inner().delete(ids)
    }

    fn clear(&self) -> Result<(), LumenError> {
        self.inner().clear()
    }

    fn contains(&self, id: &str) -> Result<bool, LumenError> {
        self.inner().contains(id)
    }

    fn len(&self) -> Result<usize, LumenError> {
        self.inner().len()
    }

    fn dimension(&self) -> usize {
        self.inner().dimension()
    }

    fn stats(&self) -> Result<StoreStats, LumenError> {
        self.inner().stats()
    }
}

/// Reject the batch if any vector's length differs from `expected`.
pub(crate) fn check_dimensions(
    expected: usize,
    vectors: &[EmbeddingVector],
) -> Result<(), LumenError> {
    match vectors.iter().find(|v| v.vector.len() != expected) {
        Some(bad) => Err(LumenError::DimensionMismatch {
            expected,
            actual: bad.vector.len(),
        }),
        None => Ok(()),
    }
}

pub(crate) fn check_query(expected: usize, query: &[f32]) -> Result<(), LumenError> {
    if query.len() != expected {
        return Err(LumenError::DimensionMismatch {
            expected,
            actual: query.len(),
        });
    }
    Ok(())
}

/// Collapse repeated ids so the last occurrence wins, keeping first-seen order.
///
/// Also returns every input id in input order.
pub(crate) fn last_write_wins(vectors: Vec<EmbeddingVector>) -> (Vec<EmbeddingVector>, Vec<String>) {
    let ids: Vec<String> = vectors.iter().map(|v| v.id.clone()).collect();
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(vectors.len());
    let mut unique: Vec<EmbeddingVector> = Vec::with_capacity(vectors.len());
    for vector in vectors {
        match slots.get(&vector.id) {
            Some(&slot) => unique[slot] = vector,
            None => {
                slots.insert(vector.id.clone(), unique.len());
                unique.push(vector);
            }
        }
    }
    (unique, ids)
}

/// Score every entry that passes `filter` and keep the best `k`.
pub(crate) fn top_k<'a, I, S>(
    entries: I,
    k: usize,
    filter: Option<&MetadataFilter>,
    score: S,
) -> Vec<SearchResult>
where
    I: IntoIterator<Item = &'a EmbeddingVector>,
    S: Fn(&[f32]) -> f64,
{
    if k == 0 {
        return Vec::new();
    }
    let mut results: Vec<SearchResult> = entries
        .into_iter()
        .filter(|entry| filter.map_or(true, |f| f.matches(&entry.metadata)))
        .map(|entry| {
            SearchResult::new(
                entry.id.clone(),
                entry.text.clone().unwrap_or_default(),
                score(&entry.vector),
                entry.metadata.clone(),
            )
        })
        .collect();
    rank_results(&mut results);
    results.truncate(k);
    results
}

pub(crate) fn squared_l2(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum()
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    dot / denom
}
