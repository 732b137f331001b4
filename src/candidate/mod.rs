//! Candidate repository — durable store of not-yet-classified concepts
//!
//! A Candidate is an observed concept the Oracle could not match to the
//! existing ontology. Candidates accumulate here with full provenance until
//! the cluster engine groups them and a cluster is promoted or rejected;
//! promotion deletes the cluster and all its member candidates together.

pub mod cluster;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Errors that can occur during candidate repository operations
#[derive(Debug, Error)]
pub enum CandidateError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for candidate repository operations
pub type CandidateResult<T> = Result<T, CandidateError>;

/// A stored candidate concept with provenance.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: i64,
    pub concept_text: String,
    pub description: String,
    pub embedding: Vec<f32>,
    pub source: String,
    pub original_keyword: String,
    pub noun_phrase_summary: String,
    pub oracle_reason: String,
    pub created_at: DateTime<Utc>,
}

/// Fields for inserting a new candidate.
#[derive(Debug, Clone)]
pub struct NewCandidate {
    pub concept_text: String,
    pub description: String,
    pub embedding: Vec<f32>,
    pub source: String,
    pub original_keyword: String,
    pub noun_phrase_summary: String,
    pub oracle_reason: String,
}

/// A group of candidates judged (so far by geometry alone) to denote the
/// same concept. Membership is recomputed from scratch on every clustering
/// pass; rows are fully replaced, never patched.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: i64,
    pub name: String,
    /// Member concept texts in cluster order.
    pub member_texts: Vec<String>,
    /// Every candidate row whose text appears in the cluster. Duplicate
    /// observations of the same text each contribute a row, so promotion
    /// sees every absorbed keyword.
    pub members: Vec<Candidate>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.member_texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_texts.is_empty()
    }
}

fn f32_slice_as_bytes(slice: &[f32]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(slice.as_ptr() as *const u8, slice.len() * 4) }
}

fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// SQLite-backed candidate repository.
///
/// Also tracks the candidate count at the last clustering pass so the
/// caller can apply the recluster-every-N policy without reclustering on
/// every insert.
pub struct CandidateRepository {
    conn: Mutex<Connection>,
}

impl CandidateRepository {
    /// Open or create a repository at the given path.
    pub fn open(path: impl AsRef<Path>) -> CandidateResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Create an in-memory repository (useful for testing).
    pub fn open_in_memory() -> CandidateResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> CandidateResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS candidates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                concept_text TEXT NOT NULL,
                description TEXT NOT NULL,
                embedding BLOB NOT NULL,
                source TEXT NOT NULL,
                original_keyword TEXT NOT NULL,
                noun_phrase_summary TEXT NOT NULL,
                oracle_reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_candidates_text
                ON candidates(concept_text);

            CREATE TABLE IF NOT EXISTS clusters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                member_texts_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS clustering_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new candidate, returning its row id.
    pub fn save(&self, candidate: &NewCandidate) -> CandidateResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO candidates (concept_text, description, embedding, source, \
             original_keyword, noun_phrase_summary, oracle_reason, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                candidate.concept_text,
                candidate.description,
                f32_slice_as_bytes(&candidate.embedding),
                candidate.source,
                candidate.original_keyword,
                candidate.noun_phrase_summary,
                candidate.oracle_reason,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Total number of stored candidates.
    pub fn count(&self) -> CandidateResult<usize> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM candidates", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// All candidates, embeddings included, in insertion order.
    pub fn all(&self) -> CandidateResult<Vec<Candidate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, concept_text, description, embedding, source, \
             original_keyword, noun_phrase_summary, oracle_reason, created_at \
             FROM candidates ORDER BY id",
        )?;
        let rows = stmt.query_map([], Self::row_to_candidate)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn row_to_candidate(row: &rusqlite::Row<'_>) -> rusqlite::Result<Candidate> {
        let blob: Vec<u8> = row.get(3)?;
        let created_raw: String = row.get(8)?;
        let created_at = DateTime::parse_from_rfc3339(&created_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Ok(Candidate {
            id: row.get(0)?,
            concept_text: row.get(1)?,
            description: row.get(2)?,
            embedding: bytes_to_f32_vec(&blob),
            source: row.get(4)?,
            original_keyword: row.get(5)?,
            noun_phrase_summary: row.get(6)?,
            oracle_reason: row.get(7)?,
            created_at,
        })
    }

    /// First candidate row for a given concept text, if any.
    pub fn find_by_text(&self, concept_text: &str) -> CandidateResult<Option<Candidate>> {
        let conn = self.conn.lock().unwrap();
        let candidate = conn
            .query_row(
                "SELECT id, concept_text, description, embedding, source, \
                 original_keyword, noun_phrase_summary, oracle_reason, created_at \
                 FROM candidates WHERE concept_text = ?1 ORDER BY id LIMIT 1",
                params![concept_text],
                Self::row_to_candidate,
            )
            .optional()?;
        Ok(candidate)
    }

    /// Every candidate row with the given concept text, in insertion order.
    pub fn all_by_text(&self, concept_text: &str) -> CandidateResult<Vec<Candidate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, concept_text, description, embedding, source, \
             original_keyword, noun_phrase_summary, oracle_reason, created_at \
             FROM candidates WHERE concept_text = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![concept_text], Self::row_to_candidate)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delete a single candidate row. Returns whether a row was deleted.
    pub fn remove(&self, id: i64) -> CandidateResult<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM candidates WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    // === Recluster policy tracking ===

    /// Whether at least `every` candidates arrived since the last pass.
    pub fn due_for_recluster(&self, every: usize) -> CandidateResult<bool> {
        let current = self.count()?;
        let conn = self.conn.lock().unwrap();
        let last: Option<String> = conn
            .query_row(
                "SELECT value FROM clustering_meta WHERE key = 'last_cluster_count'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let last = last.and_then(|v| v.parse::<usize>().ok()).unwrap_or(0);
        Ok(current.saturating_sub(last) >= every)
    }

    /// Record the current candidate count as the last clustering baseline.
    pub fn mark_reclustered(&self) -> CandidateResult<()> {
        let current = self.count()?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO clustering_meta (key, value) VALUES ('last_cluster_count', ?1)",
            params![current.to_string()],
        )?;
        Ok(())
    }

    // === Cluster rows ===

    /// Replace all cluster rows with a freshly computed set.
    pub fn replace_clusters(&self, groups: &[Vec<String>]) -> CandidateResult<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM clusters", [])?;
        for (idx, member_texts) in groups.iter().enumerate() {
            tx.execute(
                "INSERT INTO clusters (name, member_texts_json, created_at) VALUES (?1, ?2, ?3)",
                params![
                    format!("cluster_{}", idx + 1),
                    serde_json::to_string(member_texts)?,
                    Utc::now().to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(groups.len())
    }

    /// Clusters with at least `min_size` members, optionally filtered to
    /// those containing a given concept text. Member candidate rows are
    /// resolved by text.
    pub fn clusters(
        &self,
        min_size: usize,
        containing: Option<&str>,
    ) -> CandidateResult<Vec<Cluster>> {
        let raw: Vec<(i64, String, String)> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt =
                conn.prepare("SELECT id, name, member_texts_json FROM clusters ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let mut clusters = Vec::new();
        for (id, name, members_json) in raw {
            let member_texts: Vec<String> = serde_json::from_str(&members_json)?;
            if member_texts.len() < min_size {
                continue;
            }
            if let Some(text) = containing {
                if !member_texts.iter().any(|m| m == text) {
                    continue;
                }
            }
            let mut members = Vec::new();
            let mut seen_texts: HashSet<&String> = HashSet::new();
            for text in &member_texts {
                if seen_texts.insert(text) {
                    members.extend(self.all_by_text(text)?);
                }
            }
            clusters.push(Cluster {
                id,
                name,
                member_texts,
                members,
            });
        }
        Ok(clusters)
    }

    /// Delete a cluster and every candidate row whose text is a member.
    ///
    /// The cluster and its candidates leave the repository together; this is
    /// the absorption step after a promotion or an explicit rejection.
    pub fn remove_cluster(&self, cluster_id: i64) -> CandidateResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let members_json: Option<String> = tx
            .query_row(
                "SELECT member_texts_json FROM clusters WHERE id = ?1",
                params![cluster_id],
                |row| row.get(0),
            )
            .optional()?;
        let members_json = members_json.ok_or(CandidateError::ClusterNotFound(cluster_id))?;
        let member_texts: Vec<String> = serde_json::from_str(&members_json)?;
        for text in &member_texts {
            tx.execute("DELETE FROM candidates WHERE concept_text = ?1", params![text])?;
        }
        tx.execute("DELETE FROM clusters WHERE id = ?1", params![cluster_id])?;
        tx.commit()?;
        Ok(())
    }

    // === Backup ===

    /// Write a full online backup of this repository to `path`.
    pub fn backup_to(&self, path: impl AsRef<Path>) -> CandidateResult<()> {
        let conn = self.conn.lock().unwrap();
        let mut dst = Connection::open(path)?;
        let backup = rusqlite::backup::Backup::new(&conn, &mut dst)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        Ok(())
    }

    /// Replace this repository's contents from a backup file.
    pub fn restore_from(&self, path: impl AsRef<Path>) -> CandidateResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let src = Connection::open(path)?;
        let backup = rusqlite::backup::Backup::new(&src, &mut conn)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        Ok(())
    }
}
