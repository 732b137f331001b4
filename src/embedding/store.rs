//! EmbeddingStore — persistent (concept, description, vector) storage
//!
//! Backed by a single SQLite table with a `staged` partition flag. Vectors
//! are L2-normalized on insert; search is a ranked cosine-distance scan with
//! an exclusion set so near-root categories never win a match.
//!
//! Thread-safe via internal mutex on the connection.

use super::embedder::{cosine_distance, l2_normalize};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Errors that can occur during vector storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for vector storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A search hit, ranked by ascending cosine distance.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredConcept {
    pub concept_id: String,
    pub description: String,
    pub distance: f32,
}

/// SQLite-backed embedding store with committed and staged partitions.
pub struct EmbeddingStore {
    conn: Mutex<Connection>,
}

/// Reinterpret a `&[f32]` slice as raw bytes for blob storage.
///
/// # Safety
/// f32 has no padding and a fixed layout; this is a trivial reinterpretation.
fn f32_slice_as_bytes(slice: &[f32]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(slice.as_ptr() as *const u8, slice.len() * 4) }
}

/// Decode a little-endian f32 blob back into a vector.
fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl EmbeddingStore {
    /// Open or create a store at the given path. Uses WAL mode for
    /// concurrent reads during writes.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Create an in-memory store (useful for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS concept_vectors (
                concept_id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                embedding BLOB NOT NULL,
                staged INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_vectors_staged
                ON concept_vectors(staged);
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a concept vector.
    ///
    /// An empty embedding is stored as-is and treated as maximally distant
    /// by search, never as an error.
    pub fn upsert(
        &self,
        concept_id: &str,
        description: &str,
        embedding: Vec<f32>,
        staged: bool,
    ) -> StoreResult<()> {
        let mut normalized = embedding;
        l2_normalize(&mut normalized);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO concept_vectors(concept_id, description, embedding, staged) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                concept_id,
                description,
                f32_slice_as_bytes(&normalized),
                staged as i64
            ],
        )?;
        Ok(())
    }

    /// Remove a concept vector. Returns whether a row was deleted.
    pub fn remove(&self, concept_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM concept_vectors WHERE concept_id = ?1",
            params![concept_id],
        )?;
        Ok(n > 0)
    }

    /// Look up a stored description by concept id.
    pub fn description(&self, concept_id: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let desc = conn
            .query_row(
                "SELECT description FROM concept_vectors WHERE concept_id = ?1",
                params![concept_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(desc)
    }

    /// Ranked nearest-neighbor search by ascending cosine distance.
    ///
    /// Concepts in `exclude_ids` never appear in results; rows without a
    /// usable embedding rank last (distance 2.0) rather than erroring.
    pub fn search(
        &self,
        query_embedding: &[f32],
        k: usize,
        exclude_ids: &HashSet<String>,
        include_staged: bool,
    ) -> StoreResult<Vec<ScoredConcept>> {
        let mut normalized_query = query_embedding.to_vec();
        l2_normalize(&mut normalized_query);

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT concept_id, description, embedding FROM concept_vectors \
             WHERE staged <= ?1",
        )?;
        let rows = stmt.query_map(params![include_staged as i64], |row| {
            let id: String = row.get(0)?;
            let description: String = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            Ok((id, description, blob))
        })?;

        let mut hits: Vec<ScoredConcept> = Vec::new();
        for row in rows {
            let (concept_id, description, blob) = row?;
            if exclude_ids.contains(&concept_id) {
                continue;
            }
            let vector = bytes_to_f32_vec(&blob);
            let distance = cosine_distance(&normalized_query, &vector);
            hits.push(ScoredConcept {
                concept_id,
                description,
                distance,
            });
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }

    /// Number of stored concepts, optionally including the staged partition.
    pub fn count(&self, include_staged: bool) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM concept_vectors WHERE staged <= ?1",
            params![include_staged as i64],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Move a concept between the staged and committed partitions.
    /// Returns whether a row was updated.
    pub fn set_staged(&self, concept_id: &str, staged: bool) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE concept_vectors SET staged = ?1 WHERE concept_id = ?2",
            params![staged as i64, concept_id],
        )?;
        Ok(n > 0)
    }

    /// Drop every staged row (used when a run's staging is discarded).
    pub fn clear_staged(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM concept_vectors WHERE staged = 1", [])?;
        Ok(n)
    }

    /// Write a full online backup of this store to `path`.
    pub fn backup_to(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let mut dst = Connection::open(path)?;
        let backup = rusqlite::backup::Backup::new(&conn, &mut dst)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        Ok(())
    }

    /// Replace this store's contents byte-for-byte from a backup file.
    pub fn restore_from(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let src = Connection::open(path)?;
        let backup = rusqlite::backup::Backup::new(&src, &mut conn)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn excl(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn search_ranks_by_ascending_distance() {
        let store = EmbeddingStore::open_in_memory().unwrap();
        store
            .upsert("travel", "going places", vec![0.9, 0.3, 0.1], false)
            .unwrap();
        store
            .upsert("journey", "a long trip", vec![0.85, 0.35, 0.15], false)
            .unwrap();
        store
            .upsert("democracy", "rule by the people", vec![0.1, 0.2, 0.95], false)
            .unwrap();

        let hits = store
            .search(&[0.9, 0.3, 0.1], 3, &HashSet::new(), false)
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].concept_id, "travel");
        assert_eq!(hits[1].concept_id, "journey");
        assert!(hits[0].distance <= hits[1].distance);
        assert!(hits[1].distance <= hits[2].distance);
    }

    #[test]
    fn exclusion_set_removes_candidates_entirely() {
        let store = EmbeddingStore::open_in_memory().unwrap();
        store
            .upsert("generic", "a near-root category", vec![1.0, 0.0], false)
            .unwrap();

        let hits = store
            .search(&[1.0, 0.0], 5, &excl(&["generic"]), false)
            .unwrap();
        assert!(hits.is_empty(), "excluded concept must never be returned");
    }

    #[test]
    fn staged_rows_are_invisible_unless_requested() {
        let store = EmbeddingStore::open_in_memory().unwrap();
        store
            .upsert("pending", "not yet committed", vec![1.0, 0.0], true)
            .unwrap();

        assert_eq!(store.count(false).unwrap(), 0);
        assert_eq!(store.count(true).unwrap(), 1);

        let committed_only = store
            .search(&[1.0, 0.0], 5, &HashSet::new(), false)
            .unwrap();
        assert!(committed_only.is_empty());

        let with_staged = store
            .search(&[1.0, 0.0], 5, &HashSet::new(), true)
            .unwrap();
        assert_eq!(with_staged.len(), 1);

        assert!(store.set_staged("pending", false).unwrap());
        assert_eq!(store.count(false).unwrap(), 1);
    }

    #[test]
    fn empty_embedding_ranks_last_not_error() {
        let store = EmbeddingStore::open_in_memory().unwrap();
        store.upsert("hollow", "no vector", vec![], false).unwrap();
        store
            .upsert("solid", "has a vector", vec![1.0, 0.0], false)
            .unwrap();

        let hits = store
            .search(&[1.0, 0.0], 5, &HashSet::new(), false)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].concept_id, "solid");
        assert_eq!(hits[1].concept_id, "hollow");
        assert_eq!(hits[1].distance, 2.0);
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::open(dir.path().join("vectors.db")).unwrap();
        store
            .upsert("kept", "survives rollback", vec![1.0, 0.0], false)
            .unwrap();

        let backup_path = dir.path().join("vectors.backup.db");
        store.backup_to(&backup_path).unwrap();

        store
            .upsert("intruder", "added after backup", vec![0.0, 1.0], false)
            .unwrap();
        assert_eq!(store.count(true).unwrap(), 2);

        store.restore_from(&backup_path).unwrap();
        assert_eq!(store.count(true).unwrap(), 1);
        assert!(store.description("kept").unwrap().is_some());
        assert!(store.description("intruder").unwrap().is_none());
    }
}
