//! Copy-on-write entry sets for the in-process backends.
//!
//! Readers clone an `Arc` and never block on writers. A writer holds the
//! writer mutex, builds the next snapshot off to the side, persists it, and
//! only then swaps it in.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use lumen_core::{EmbeddingVector, LumenError};

/// An immutable set of entries keyed by id.
#[derive(Debug, Default, Clone)]
pub(crate) struct Snapshot {
    entries: Vec<EmbeddingVector>,
    positions: HashMap<String, usize>,
}

impl Snapshot {
    /// Build from persisted entries. Later duplicates replace earlier ones.
    pub(crate) fn from_entries(entries: Vec<EmbeddingVector>) -> Self {
        let mut snapshot = Self::default();
        snapshot.upsert(entries);
        snapshot
    }

    pub(crate) fn entries(&self) -> &[EmbeddingVector] {
        &self.entries
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    /// Replace entries in place when the id exists, append otherwise.
    pub(crate) fn upsert(&mut self, vectors: Vec<EmbeddingVector>) {
        for vector in vectors {
            match self.positions.get(&vector.id) {
                Some(&pos) => self.entries[pos] = vector,
                None => {
                    self.positions.insert(vector.id.clone(), self.entries.len());
                    self.entries.push(vector);
                }
            }
        }
    }

    /// Drop the given ids, returning how many were present.
    pub(crate) fn remove(&mut self, ids: &[String]) -> usize {
        let doomed: HashSet<&str> = ids
            .iter()
            .map(String::as_str)
            .filter(|id| self.positions.contains_key(*id))
            .collect();
        if doomed.is_empty() {
            return 0;
        }
        let before = self.entries.len();
        self.entries.retain(|e| !doomed.contains(e.id.as_str()));
        self.positions = self
            .entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (e.id.clone(), pos))
            .collect();
        before - self.entries.len()
    }
}

/// Holds the current [`Snapshot`] and serializes writers.
#[derive(Debug, Default)]
pub(crate) struct SnapshotCell {
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl SnapshotCell {
    pub(crate) fn new(snapshot: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        }
    }

    /// The snapshot visible right now.
    pub(crate) fn load(&self) -> Arc<Snapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Apply `edit` to a copy of the current snapshot, `persist` it, then
    /// publish it. Nothing is published when `persist` fails.
    pub(crate) fn update<R>(
        &self,
        edit: impl FnOnce(&mut Snapshot) -> R,
        persist: impl FnOnce(&Snapshot) -> Result<(), LumenError>,
    ) -> Result<R, LumenError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = Snapshot::clone(&self.load());
        let outcome = edit(&mut next);
        persist(&next)?;
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::new(next);
        Ok(outcome)
    }
}
