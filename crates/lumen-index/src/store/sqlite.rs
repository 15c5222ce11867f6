//! SQLite-backed store with embeddings kept as little-endian `f32` BLOBs.
//!
//! Cosine similarity is computed in Rust over every row that passes the
//! metadata filter.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use lumen_core::{
    EmbeddingVector, LumenError, Metadata, MetadataFilter, SearchResult, StoreStats, StoreType,
    SOURCE_KEY,
};
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use super::{check_dimensions, check_query, cosine_similarity, last_write_wins, top_k, VectorStore};

/// File name used inside the persist directory.
pub const SQLITE_FILE: &str = "vectors.db";

const DIMENSION_KEY: &str = "embedding_dimensions";

/// Relational vector store on SQLite.
///
/// # Examples
///
/// ```
/// use lumen_core::{source_metadata, EmbeddingVector};
/// use lumen_index::store::{SqliteStore, VectorStore};
///
/// let store = SqliteStore::open(2, None).unwrap();
/// store
///     .add_vectors(vec![EmbeddingVector {
///         id: "db".into(),
///         vector: vec![1.0, 0.0],
///         metadata: source_metadata("src/db.rs"),
///         text: Some("fn connect() {}".into()),
///     }])
///     .unwrap();
/// assert!(store.contains("db").unwrap());
/// let hits = store.query(&[1.0, 0.0], 1, None).unwrap();
/// assert_eq!(hits[0].text, "fn connect() {}");
/// ```
#[derive(Debug)]
pub struct SqliteStore {
    dimension: usize,
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open `dir/vectors.db`, or an in-memory database when `dir` is `None`.
    ///
    /// A file that is not a valid database, or that was created for another
    /// dimension, is renamed to `vectors.db.corrupt` and replaced by a fresh
    /// one. If even that fails the store runs in memory.
    ///
    /// # Errors
    ///
    /// Returns [`LumenError::Database`] only if no database can be opened at all.
    pub fn open(dimension: usize, dir: Option<&Path>) -> Result<Self, LumenError> {
        let Some(dir) = dir else {
            return Self::in_memory(dimension);
        };
        let path = dir.join(SQLITE_FILE);
        if let Err(e) = fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), error = %e, "cannot create index directory, using memory");
            return Self::in_memory(dimension);
        }

        match Self::open_file(&path, dimension) {
            Ok(store) => return Ok(store),
            Err(e) => {
                let aside = path.with_extension("db.corrupt");
                warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "unusable vector database, starting empty"
                );
                if let Err(e) = fs::rename(&path, &aside) {
                    warn!(path = %path.display(), error = %e, "cannot move vector database aside");
                }
            }
        }

        match Self::open_file(&path, dimension) {
            Ok(store) => Ok(store),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "falling back to an in-memory database");
                Self::in_memory(dimension)
            }
        }
    }

    fn in_memory(dimension: usize) -> Result<Self, LumenError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            LumenError::Database(format!("failed to create in-memory database: {e}"))
        })?;
        Self::init(conn, dimension, None)
    }

    fn open_file(path: &Path, dimension: usize) -> Result<Self, LumenError> {
        let conn = Connection::open(path)
            .map_err(|e| LumenError::Database(format!("failed to open database: {e}")))?;
        let check: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| LumenError::Database(format!("integrity check failed: {e}")))?;
        if check != "ok" {
            return Err(LumenError::Database(format!("integrity check failed: {check}")));
        }
        let store = Self::init(conn, dimension, Some(path.to_path_buf()))?;
        store.count()?;
        Ok(store)
    }

    fn init(conn: Connection, dimension: usize, path: Option<PathBuf>) -> Result<Self, LumenError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vectors (
                id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL,
                content TEXT,
                source TEXT,
                added_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS vectors_source ON vectors(source);
            ",
        )
        .map_err(|e| LumenError::Database(format!("failed to create schema: {e}")))?;

        let store = Self {
            dimension,
            path,
            conn: Mutex::new(conn),
        };
        store.set_dimensions(dimension)?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the dimension on first use; reject a database built for another.
    fn set_dimensions(&self, dimensions: usize) -> Result<(), LumenError> {
        let conn = self.lock();
        let existing: Option<String> = match conn.query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![DIMENSION_KEY],
            |row| row.get(0),
        ) {
            Ok(value) => Some(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => {
                return Err(LumenError::Database(format!(
                    "failed to read stored dimension: {e}"
                )))
            }
        };

        if let Some(stored) = existing {
            let stored_dims: usize = stored.parse().map_err(|_| {
                LumenError::Database(format!("corrupted dimension metadata: '{stored}'"))
            })?;
            if stored_dims != dimensions {
                return Err(LumenError::Database(format!(
                    "database was created with {stored_dims} dimensions but {dimensions} are configured"
                )));
            }
            return Ok(());
        }

        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![DIMENSION_KEY, dimensions.to_string()],
        )
        .map_err(|e| LumenError::Database(format!("failed to store dimension: {e}")))?;
        Ok(())
    }

    fn load_rows(&self, filter: Option<&MetadataFilter>) -> Result<Vec<EmbeddingVector>, LumenError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT id, embedding, metadata, content FROM vectors")
            .map_err(|e| LumenError::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .map_err(|e| LumenError::Database(format!("failed to query vectors: {e}")))?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, blob, metadata_json, content) =
                row.map_err(|e| LumenError::Database(format!("failed to read row: {e}")))?;
            let metadata: Metadata = serde_json::from_str(&metadata_json)?;
            if filter.is_some_and(|f| !f.matches(&metadata)) {
                continue;
            }
            let vector = bytes_to_floats(&blob);
            if vector.len() != self.dimension {
                warn!(id = %id, len = vector.len(), "skipping row with malformed embedding");
                continue;
            }
            entries.push(EmbeddingVector {
                id,
                vector,
                metadata,
                text: content,
            });
        }
        Ok(entries)
    }

    fn count(&self) -> Result<usize, LumenError> {
        let total: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM vectors", [], |row| row.get(0))
            .map_err(|e| LumenError::Database(format!("failed to count vectors: {e}")))?;
        Ok(total as usize)
    }
}

impl VectorStore for SqliteStore {
    fn add_vectors(&self, vectors: Vec<EmbeddingVector>) -> Result<Vec<String>, LumenError> {
        check_dimensions(self.dimension, &vectors)?;
        let (unique, ids) = last_write_wins(vectors);
        let added_at = Utc::now().to_rfc3339();

        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| LumenError::Database(format!("failed to begin transaction: {e}")))?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO vectors (id, embedding, metadata, content, source, added_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(|e| LumenError::Database(format!("failed to prepare insert: {e}")))?;
            for v in &unique {
                let metadata = serde_json::to_string(&v.metadata)?;
                let source = v.metadata.get(SOURCE_KEY).map(|s| s.to_string());
                stmt.execute(params![
                    v.id,
                    floats_to_bytes(&v.vector),
                    metadata,
                    v.text,
                    source,
                    added_at,
                ])
                .map_err(|e| LumenError::Database(format!("failed to insert vector: {e}")))?;
            }
        }
        tx.commit()
            .map_err(|e| LumenError::Database(format!("failed to commit vectors: {e}")))?;
        debug!(inserted = unique.len(), "vectors committed");
        Ok(ids)
    }

    fn query(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, LumenError> {
        check_query(self.dimension, query)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let entries = self.load_rows(filter)?;
        Ok(top_k(&entries, k, None, |v| cosine_similarity(query, v)))
    }

    fn delete(&self, ids: &[String]) -> Result<usize, LumenError> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| LumenError::Database(format!("failed to begin transaction: {e}")))?;
        let mut removed = 0;
        for id in ids {
            removed += tx
                .execute("DELETE FROM vectors WHERE id = ?1", params![id])
                .map_err(|e| LumenError::Database(format!("failed to delete vector: {e}")))?;
        }
        tx.commit()
            .map_err(|e| LumenError::Database(format!("failed to commit delete: {e}")))?;
        Ok(removed)
    }

    fn clear(&self) -> Result<(), LumenError> {
        self.lock()
            .execute("DELETE FROM vectors", [])
            .map_err(|e| LumenError::Database(format!("failed to clear vectors: {e}")))?;
        Ok(())
    }

    fn contains(&self, id: &str) -> Result<bool, LumenError> {
        let count: i64 = self
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM vectors WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(|e| LumenError::Database(format!("failed to check vector: {e}")))?;
        Ok(count > 0)
    }

    fn len(&self) -> Result<usize, LumenError> {
        self.count()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn stats(&self) -> Result<StoreStats, LumenError> {
        Ok(StoreStats {
            store_type: StoreType::RelationalVector,
            count: self.count()?,
            dimension: self.dimension,
            location: self.path.clone(),
        })
    }
}

fn floats_to_bytes(floats: &[f32]) -> Vec<u8> {
    floats.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
