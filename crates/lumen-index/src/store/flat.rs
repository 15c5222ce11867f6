//! Flat in-process index scored by squared Euclidean distance.

use std::fs;
use std::path::{Path, PathBuf};

use bincode::config::standard as bincode_config;
use bincode::{decode_from_slice, encode_to_vec, Decode, Encode};
use lumen_core::{
    EmbeddingVector, LumenError, MetadataFilter, SearchResult, StoreStats, StoreType,
};
use tracing::{debug, warn};

use super::snapshot::{Snapshot, SnapshotCell};
use super::{check_dimensions, check_query, last_write_wins, squared_l2, top_k, VectorStore};

/// File name used inside the persist directory.
pub const FLAT_INDEX_FILE: &str = "flat.idx";

#[derive(Encode, Decode)]
struct FlatIndexFile {
    version: u32,
    dimension: u64,
    entries: Vec<EmbeddingVector>,
}

impl FlatIndexFile {
    const VERSION: u32 = 1;
}

/// Brute-force nearest-neighbor index over an in-memory entry list.
///
/// Scores are `1 / (1 + d)` where `d` is the squared L2 distance, so an
/// exact match scores `1.0`.
///
/// # Examples
///
/// ```
/// use lumen_core::{source_metadata, EmbeddingVector};
/// use lumen_index::store::{FlatIndex, VectorStore};
///
/// let index = FlatIndex::open(2, None);
/// index
///     .add_vectors(vec![EmbeddingVector {
///         id: "a".into(),
///         vector: vec![0.0, 1.0],
///         metadata: source_metadata("a.rs"),
///         text: None,
///     }])
///     .unwrap();
/// let hits = index.query(&[0.0, 1.0], 5, None).unwrap();
/// assert_eq!(hits[0].score, 1.0);
/// ```
#[derive(Debug)]
pub struct FlatIndex {
    dimension: usize,
    path: Option<PathBuf>,
    cell: SnapshotCell,
}

impl FlatIndex {
    /// Open an index, loading `dir/flat.idx` when `dir` is given.
    ///
    /// A missing file yields an empty index. A file that cannot be decoded,
    /// or that was written for another dimension, is ignored with a warning
    /// and overwritten by the next write.
    pub fn open(dimension: usize, dir: Option<&Path>) -> Self {
        let path = dir.map(|d| d.join(FLAT_INDEX_FILE));
        let entries = path
            .as_deref()
            .map(|p| load_entries(p, dimension))
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
        let file = FlatIndexFile {
            version: FlatIndexFile::VERSION,
            dimension: self.dimension as u64,
            entries: snapshot.entries().to_vec(),
        };
        let bytes = encode_to_vec(&file, bincode_config())
            .map_err(|e| LumenError::Database(format!("failed to encode flat index: {e}")))?;
        write_atomically(path, &bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "flat index persisted");
        Ok(())
    }
}

fn load_entries(path: &Path, dimension: usize) -> Vec<EmbeddingVector> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read flat index, starting empty");
            return Vec::new();
        }
    };
    let file: FlatIndexFile = match decode_from_slice(&data, bincode_config()) {
        Ok((file, _)) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt flat index, starting empty");
            return Vec::new();
        }
    };
    if file.version != FlatIndexFile::VERSION {
        warn!(
            path = %path.display(),
            found = file.version,
            expected = FlatIndexFile::VERSION,
            "unsupported flat index version, starting empty"
        );
        return Vec::new();
    }
    let stored_dim = file.dimension as usize;
    if stored_dim != dimension || file.entries.iter().any(|e| e.vector.len() != dimension) {
        warn!(
            path = %path.display(),
            stored = stored_dim,
            configured = dimension,
            "flat index has an incompatible dimension, starting empty"
        );
        return Vec::new();
    }
    debug!(path = %path.display(), entries = file.entries.len(), "flat index loaded");
    file.entries
}

/// Write to a sibling temp file, then rename over `path`.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), LumenError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            LumenError::Database(format!("failed to create index directory: {e}"))
        })?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)
        .map_err(|e| LumenError::Database(format!("failed to write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| LumenError::Database(format!("failed to replace {}: {e}", path.display())))?;
    Ok(())
}

impl VectorStore for FlatIndex {
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
            1.0 / (1.0 + squared_l2(query, v))
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
            store_type: StoreType::InMemoryIndex,
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
    fn nearest_vector_ranks_first() {
        let index = FlatIndex::open(2, None);
        index
            .add_vectors(vec![
                vector("far", &[10.0, 10.0], "a.rs"),
                vector("near", &[1.0, 1.0], "b.rs"),
                vector("exact", &[0.0, 1.0], "c.rs"),
            ])
            .unwrap();
        let hits = index.query(&[0.0, 1.0], 3, None).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "near", "far"]);
        assert_eq!(hits[0].score, 1.0);
        assert!((hits[1].score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn wrong_dimension_add_inserts_nothing() {
        let index = FlatIndex::open(2, None);
        let err = index
            .add_vectors(vec![vector("ok", &[1.0, 0.0], "a.rs"), vector("bad", &[1.0], "a.rs")])
            .unwrap_err();
        assert!(matches!(err, LumenError::DimensionMismatch { .. }));
        assert_eq!(index.len().unwrap(), 0);
    }

    #[test]
    fn wrong_dimension_query_is_rejected() {
        let index = FlatIndex::open(3, None);
        assert!(matches!(
            index.query(&[1.0], 1, None),
            Err(LumenError::DimensionMismatch { expected: 3, actual: 1 })
        ));
    }

    #[test]
    fn reopen_restores_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = FlatIndex::open(2, Some(dir.path()));
            index
                .add_vectors(vec![vector("a", &[1.0, 0.0], "a.rs"), vector("b", &[0.0, 1.0], "b.rs")])
                .unwrap();
        }
        let index = FlatIndex::open(2, Some(dir.path()));
        assert_eq!(index.len().unwrap(), 2);
        let hits = index.query(&[1.0, 0.0], 1, None).unwrap();
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[0].text, "text of a");
    }

    #[test]
    fn other_dimension_on_disk_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        FlatIndex::open(2, Some(dir.path()))
            .add_vectors(vec![vector("a", &[1.0, 0.0], "a.rs")])
            .unwrap();
        let index = FlatIndex::open(3, Some(dir.path()));
        assert_eq!(index.len().unwrap(), 0);
        index.add_vectors(vec![vector("b", &[1.0, 0.0, 0.0], "b.rs")]).unwrap();
        assert_eq!(FlatIndex::open(3, Some(dir.path())).len().unwrap(), 1);
    }

    #[test]
    fn delete_and_clear_persist() {
        let dir = tempfile::tempdir().unwrap();
        let index = FlatIndex::open(1, Some(dir.path()));
        index
            .add_vectors(vec![vector("a", &[1.0], "x"), vector("b", &[2.0], "x")])
            .unwrap();
        assert_eq!(index.delete(&["a".into(), "missing".into()]).unwrap(), 1);
        assert_eq!(FlatIndex::open(1, Some(dir.path())).len().unwrap(), 1);
        index.clear().unwrap();
        assert_eq!(FlatIndex::open(1, Some(dir.path())).len().unwrap(), 0);
    }
}
