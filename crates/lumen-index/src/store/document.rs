//! Embedded document collection persisted as a single JSON file.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lumen_core::{
    EmbeddingVector, LumenError, Metadata, MetadataFilter, SearchResult, StoreStats, StoreType,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::flat::write_atomically;
use super::snapshot::{Snapshot, SnapshotCell};
use super::{check_dimensions, check_query, cosine_similarity, last_write_wins, top_k, VectorStore};

/// File name used inside the persist directory.
pub const COLLECTION_FILE: &str = "collection.json";

const COLLECTION_NAME: &str = "lumen";
const METRIC: &str = "cosine";

#[derive(Serialize, Deserialize)]
struct CollectionFile {
    name: String,
    metric: String,
    dimension: usize,
    updated_at: DateTime<Utc>,
    documents: Vec<StoredDocument>,
}

#[derive(Serialize, Deserialize)]
struct StoredDocument {
    id: String,
    embedding: Vec<f32>,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    document: Option<String>,
}

impl From<StoredDocument> for EmbeddingVector {
    fn from(doc: StoredDocument) -> Self {
        EmbeddingVector {
            id: doc.id,
            vector: doc.embedding,
            metadata: doc.metadata,
            text: doc.document,
        }
    }
}

impl From<&EmbeddingVector> for StoredDocument {
    fn from(v: &EmbeddingVector) -> Self {
        StoredDocument {
            id: v.id.clone(),
            embedding: v.vector.clone(),
            metadata: v.metadata.clone(),
            document: v.text.clone(),
        }
    }
}

/// A document collection ranked by cosine distance.
///
/// The native distance is `1 - cos(a, b)`; results are scored `1 - distance`
/// so identical directions score `1.0` and opposite ones `-1.0`.
///
/// # Examples
///
/// ```
/// use lumen_core::{source_metadata, EmbeddingVector};
/// use lumen_index::store::{DocumentStore, VectorStore};
///
/// let store = DocumentStore::open(2, None);
/// store
///     .add_vectors(vec![EmbeddingVector {
///         id: "auth".into(),
///         vector: vec![3.0, 4.0],
///         metadata: source_metadata("src/auth.rs"),
///         text: Some("fn login() {}".into()),
///     }])
///     .unwrap();
/// let hits = store.query(&[0.6, 0.8], 1, None).unwrap();
/// assert!((hits[0].score - 1.0).abs() < 1e-6);
/// assert_eq!(hits[0].source_file, "src/auth.rs");
/// ```
#[derive(Debug)]
pub struct DocumentStore {
    dimension: usize,
    path: Option<PathBuf>,
    cell: SnapshotCell,
}

impl DocumentStore {
    /// Open a collection, loading `dir/collection.json` when `dir` is given.
    ///
    /// Unreadable collections and collections of another dimension are
    /// ignored with a warning.
    pub fn open(dimension: usize, dir: Option<&Path>) -> Self {
        let path = dir.map(|d| d.join(COLLECTION_FILE));
        let entries = path
            .as_deref()
            .map(|p| load_documents(p, dimension))
            .unwrap_or_default();
        Self {
            dimension,
            path,
            cell: SnapshotCell::new(Snapshot::from_entries(entries)),
        }
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<(), LumenError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = CollectionFile {
            name: COLLECTION_NAME.to_string(),
            metric: METRIC.to_string(),
            dimension: self.dimension,
            updated_at: Utc::now(),
            documents: snapshot.entries().iter().map(StoredDocument::from).collect(),
        };
        let bytes = serde_json::to_vec(&file)?;
        write_atomically(path, &bytes)?;
        debug!(path = %path.display(), documents = file.documents.len(), "collection persisted");
        Ok(())
    }
}

fn load_documents(path: &Path, dimension: usize) -> Vec<EmbeddingVector> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read collection, starting empty");
            return Vec::new();
        }
    };
    let file: CollectionFile = match serde_json::from_slice(&data) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt collection, starting empty");
            return Vec::new();
        }
    };
    if file.metric != METRIC {
        warn!(path = %path.display(), metric = %file.metric, "unsupported collection metric, starting empty");
        return Vec::new();
    }
    if file.dimension != dimension || file.documents.iter().any(|d| d.embedding.len() != dimension)
    {
        warn!(
            path = %path.display(),
            stored = file.dimension,
            configured = dimension,
            "collection has an incompatible dimension, starting empty"
        );
        return Vec::new();
    }
    debug!(
        path = %path.display(),
        documents = file.documents.len(),
        updated_at = %file.updated_at,
        "collection loaded"
    );
    file.documents.into_iter().map(EmbeddingVector::from).collect()
}

impl VectorStore for DocumentStore {
    fn add_vectors(&self, vectors: Vec<EmbeddingVector>) -> Result<Vec<String>, LumenError> {
        check_dimensions(self.dimension, &vectors)?;
        let (unique, ids) = last_write_wins(vectors);
        self.cell
            .update(|snap| snap.upsert(unique), |snap| self.persist(snap))?;
        Ok(ids)
    }

    fn query(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, LumenError> {
        check_query(self.dimension, query)?;
        let snapshot = self.cell.load();
        Ok(top_k(snapshot.entries(), k, filter, |v| {
            let distance = 1.0 - cosine_similarity(query, v);
            1.0 - distance
        }))
    }

    fn delete(&self, ids: &[String]) -> Result<usize, LumenError> {
        if !ids.iter().any(|id| self.cell.load().contains(id)) {
            return Ok(0);
        }
        self.cell.update(|snap| snap.remove(ids), |snap| self.persist(snap))
    }

    fn clear(&self) -> Result<(), LumenError> {
        self.cell
            .update(|snap| *snap = Snapshot::default(), |snap| self.persist(snap))
    }

    fn contains(&self, id: &str) -> Result<bool, LumenError> {
        Ok(self.cell.load().contains(id))
    }

    fn len(&self) -> Result<usize, LumenError> {
        Ok(self.cell.load().len())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn stats(&self) -> Result<StoreStats, LumenError> {
        Ok(StoreStats {
            store_type: StoreType::EmbeddedDocStore,
            count: self.cell.load().len(),
            dimension: self.dimension,
            location: self.path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::vector;

    #[test]
    fn cosine_ignores_magnitude() {
        let store = DocumentStore::open(2, None);
        store
            .add_vectors(vec![
                vector("long", &[10.0, 0.0], "a.rs"),
                vector("diagonal", &[1.0, 1.0], "b.rs"),
                vector("opposite", &[-1.0, 0.0], "c.rs"),
            ])
            .unwrap();
        let hits = store.query(&[1.0, 0.0], 3, None).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["long", "diagonal", "opposite"]);
        assert!((hits[0].score - 1.0).abs() < 1e-9);
        assert!((hits[2].score + 1.0).abs() < 1e-9);
    }

    #[test]
    fn collection_file_is_readable_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(2, Some(dir.path()));
        store.add_vectors(vec![vector("a", &[1.0, 0.0], "a.rs")]).unwrap();

        let raw = fs::read_to_string(dir.path().join(COLLECTION_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["dimension"], 2);
        assert_eq!(json["metric"], "cosine");
        assert_eq!(json["documents"][0]["id"], "a");
        assert_eq!(json["documents"][0]["metadata"]["source"], "a.rs");
    }

    #[test]
    fn upsert_keeps_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(2, Some(dir.path()));
        store.add_vectors(vec![vector("a", &[1.0, 0.0], "old.rs")]).unwrap();
        store.add_vectors(vec![vector("a", &[0.0, 1.0], "new.rs")]).unwrap();

        let reopened = DocumentStore::open(2, Some(dir.path()));
        assert_eq!(reopened.len().unwrap(), 1);
        let hits = reopened.query(&[0.0, 1.0], 1, None).unwrap();
        assert_eq!(hits[0].source_file, "new.rs");
    }

    #[test]
    fn truncated_collection_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(COLLECTION_FILE), "{\"name\":\"lumen\",\"docu").unwrap();
        let store = DocumentStore::open(2, Some(dir.path()));
        assert!(store.is_empty().unwrap());
        assert!(store.query(&[1.0, 0.0], 5, None).unwrap().is_empty());
    }
}
