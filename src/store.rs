//! Vector Store and per-folder private storage.
//!
//! Each watched folder owns a directory holding two SQLite files:
//! `index.sqlite` (documents, chunks and the dimension-specific vector
//! tables) and `fingerprints.sqlite` (the [`FingerprintStore`]). Vector
//! tables carry no foreign keys, so every delete of a document or chunk
//! removes the matching vector rows from every vector table in the same
//! transaction.

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{IndexError, Result};
use crate::fingerprint::FingerprintStore;
use crate::migrate;
use crate::models::{Chunk, Document, Fingerprint, RowCounts};

const INDEX_DB: &str = "index.sqlite";
const FINGERPRINT_DB: &str = "fingerprints.sqlite";
const META_DIMS: &str = "dims";
const META_MODEL: &str = "model_id";

/// A stored chunk joined with its document path.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub path: String,
    pub chunk_index: i64,
    pub start: i64,
    pub end: i64,
    pub text: String,
}

/// A chunk with its embedding, for similarity scoring.
#[derive(Debug, Clone)]
pub struct ChunkVector {
    pub chunk: ChunkRecord,
    pub embedding: Vec<f32>,
}

/// A document-level embedding with enough metadata to rank documents.
#[derive(Debug, Clone)]
pub struct DocumentVector {
    pub document_id: String,
    pub path: String,
    pub chunk_count: i64,
    pub modified_at: i64,
    pub embedding: Vec<f32>,
}

pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = db::connect(db_path).await?;
        migrate::migrate_index(&pool).await?;
        Ok(Self { pool })
    }

    /// Create vector tables for `dims` and record it as the folder's dimension.
    pub async fn ensure_dimension(&self, dims: usize, model_id: &str) -> Result<()> {
        migrate::ensure_vector_tables(&self.pool, dims).await?;
        self.set_meta(META_DIMS, &dims.to_string()).await?;
        self.set_meta(META_MODEL, model_id).await?;
        Ok(())
    }

    pub async fn dims(&self) -> Result<Option<usize>> {
        Ok(self
            .get_meta(META_DIMS)
            .await?
            .and_then(|v| v.parse().ok()))
    }

    pub async fn model_id(&self) -> Result<Option<String>> {
        self.get_meta(META_MODEL).await
    }

    /// Names of every chunk- and document-level vector table present.
    async fn vector_tables(&self) -> Result<(Vec<String>, Vec<String>)> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND (name LIKE 'chunk_vectors_%' OR name LIKE 'document_vectors_%') ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        let (chunk, doc): (Vec<String>, Vec<String>) = names
            .into_iter()
            .filter(|n| is_vector_table_name(n))
            .partition(|n| n.starts_with("chunk_vectors_"));
        Ok((chunk, doc))
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT id, path, size, mtime_ms, content_hash, indexed, modified_at, chunk_count \
             FROM documents ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_document).collect())
    }

    pub async fn document_by_path(&self, path: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, path, size, mtime_ms, content_hash, indexed, modified_at, chunk_count \
             FROM documents WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_document))
    }

    /// Record a document seen on scan whose content still has to be
    /// (re-)indexed. Existing chunks stay queryable until replaced.
    pub async fn mark_pending(&self, path: &str, fingerprint: &Fingerprint) -> Result<String> {
        if let Some(doc) = self.document_by_path(path).await? {
            sqlx::query("UPDATE documents SET indexed = 0, modified_at = ? WHERE id = ?")
                .bind(fingerprint.mtime_ms)
                .bind(&doc.id)
                .execute(&self.pool)
                .await?;
            return Ok(doc.id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO documents (id, path, size, mtime_ms, content_hash, indexed, modified_at, indexed_at, chunk_count)
            VALUES (?, ?, ?, ?, '', 0, ?, ?, 0)
            "#,
        )
        .bind(&id)
        .bind(path)
        .bind(fingerprint.size as i64)
        .bind(fingerprint.mtime_ms)
        .bind(fingerprint.mtime_ms)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Atomically replace a document's chunk set and vectors.
    ///
    /// Readers see either the previous chunk set or the new one, never a mix.
    pub async fn replace_document(
        &self,
        dims: usize,
        document: &Document,
        chunks: &[Chunk],
        chunk_vectors: &[Vec<f32>],
        document_vector: Option<&[f32]>,
    ) -> Result<()> {
        if chunks.len() != chunk_vectors.len() {
            return Err(IndexError::FatalStorage(format!(
                "{} chunks but {} vectors for {}",
                chunks.len(),
                chunk_vectors.len(),
                document.path
            )));
        }
        if let Some(bad) = chunk_vectors
            .iter()
            .map(|v| v.len())
            .chain(document_vector.map(|v| v.len()))
            .find(|len| *len != dims)
        {
            return Err(IndexError::FatalStorage(format!(
                "vector of {} dims written to a {}-dim index",
                bad, dims
            )));
        }

        let (chunk_tables, doc_tables) = self.vector_tables().await?;
        let chunk_table = migrate::chunk_vector_table(dims);
        let doc_table = migrate::document_vector_table(dims);
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        // Previous id for this path, which may differ from `document.id`.
        let old_id: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE path = ?")
            .bind(&document.path)
            .fetch_optional(&mut *tx)
            .await?;

        for id in old_id.iter().chain(std::iter::once(&document.id)) {
            for table in chunk_tables.iter().chain(doc_tables.iter()) {
                sqlx::query(&format!("DELETE FROM {} WHERE document_id = ?", table))
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query("DELETE FROM chunks WHERE document_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(old) = old_id.as_ref().filter(|old| **old != document.id) {
            sqlx::query("DELETE FROM documents WHERE id = ?")
                .bind(old)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO documents (id, path, size, mtime_ms, content_hash, indexed, modified_at, indexed_at, chunk_count)
            VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                path = excluded.path,
                size = excluded.size,
                mtime_ms = excluded.mtime_ms,
                content_hash = excluded.content_hash,
                indexed = 1,
                modified_at = excluded.modified_at,
                indexed_at = excluded.indexed_at,
                chunk_count = excluded.chunk_count
            "#,
        )
        .bind(&document.id)
        .bind(&document.path)
        .bind(document.fingerprint.size as i64)
        .bind(document.fingerprint.mtime_ms)
        .bind(&document.fingerprint.content_hash)
        .bind(document.modified_at)
        .bind(now)
        .bind(chunks.len() as i64)
        .execute(&mut *tx)
        .await?;

        for (chunk, vector) in chunks.iter().zip(chunk_vectors) {
            let key_phrases =
                serde_json::to_string(&chunk.key_phrases).unwrap_or_else(|_| "[]".to_string());
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, start_offset, end_offset, text, hash, key_phrases, readability)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&document.id)
            .bind(chunk.chunk_index)
            .bind(chunk.start)
            .bind(chunk.end)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(key_phrases)
            .bind(chunk.readability as f64)
            .execute(&mut *tx)
            .await?;

            sqlx::query(&format!(
                "INSERT INTO {} (chunk_id, document_id, embedding) VALUES (?, ?, ?)",
                chunk_table
            ))
            .bind(&chunk.id)
            .bind(&document.id)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }

        if let Some(vector) = document_vector {
            sqlx::query(&format!(
                "INSERT INTO {} (document_id, embedding) VALUES (?, ?)",
                doc_table
            ))
            .bind(&document.id)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete a document with its chunks and every vector that refers to
    /// them. Returns false when no document has that path.
    pub async fn delete_document(&self, path: &str) -> Result<bool> {
        let (chunk_tables, doc_tables) = self.vector_tables().await?;
        let mut tx = self.pool.begin().await?;

        let id: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE path = ?")
            .bind(path)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(id) = id else {
            return Ok(false);
        };

        for table in chunk_tables.iter().chain(doc_tables.iter()) {
            sqlx::query(&format!("DELETE FROM {} WHERE document_id = ?", table))
                .bind(&id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Every chunk with its `dims`-dimensional embedding.
    pub async fn chunk_vectors(&self, dims: usize) -> Result<Vec<ChunkVector>> {
        if !self.has_table(&migrate::chunk_vector_table(dims)).await? {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            r#"
            SELECT c.id AS chunk_id, c.document_id, d.path, c.chunk_index,
                   c.start_offset, c.end_offset, c.text, cv.embedding
            FROM {} cv
            JOIN chunks c ON c.id = cv.chunk_id
            JOIN documents d ON d.id = c.document_id
            "#,
            migrate::chunk_vector_table(dims)
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ChunkVector {
                    chunk: row_to_chunk_record(row),
                    embedding: blob_to_vec(&blob),
                }
            })
            .collect())
    }

    /// Chunks whose text contains at least one of `terms` (case-sensitive).
    pub async fn chunks_containing(&self, terms: &[String]) -> Result<Vec<ChunkRecord>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let predicate = vec!["instr(c.text, ?) > 0"; terms.len()].join(" OR ");
        let sql = format!(
            r#"
            SELECT c.id AS chunk_id, c.document_id, d.path, c.chunk_index,
                   c.start_offset, c.end_offset, c.text
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE {}
            "#,
            predicate
        );
        let mut query = sqlx::query(&sql);
        for term in terms {
            query = query.bind(term);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_chunk_record).collect())
    }

    pub async fn document_vectors(&self, dims: usize) -> Result<Vec<DocumentVector>> {
        if !self.has_table(&migrate::document_vector_table(dims)).await? {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            r#"
            SELECT d.id, d.path, d.chunk_count, d.modified_at, dv.embedding
            FROM {} dv
            JOIN documents d ON d.id = dv.document_id
            "#,
            migrate::document_vector_table(dims)
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                DocumentVector {
                    document_id: row.get("id"),
                    path: row.get("path"),
                    chunk_count: row.get("chunk_count"),
                    modified_at: row.get("modified_at"),
                    embedding: blob_to_vec(&blob),
                }
            })
            .collect())
    }

    pub async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, chunk_index, start_offset, end_offset, text, hash,
                   key_phrases, readability
            FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let key_phrases: String = row.get("key_phrases");
                let readability: f64 = row.get("readability");
                Chunk {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    start: row.get("start_offset"),
                    end: row.get("end_offset"),
                    text: row.get("text"),
                    hash: row.get("hash"),
                    key_phrases: serde_json::from_str(&key_phrases).unwrap_or_default(),
                    readability: readability as f32,
                }
            })
            .collect())
    }

    pub async fn counts(&self) -> Result<RowCounts> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;

        let (chunk_tables, doc_tables) = self.vector_tables().await?;
        let mut chunk_vectors = 0i64;
        for table in &chunk_tables {
            let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&self.pool)
                .await?;
            chunk_vectors += n;
        }
        let mut document_vectors = 0i64;
        for table in &doc_tables {
            let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&self.pool)
                .await?;
            document_vectors += n;
        }

        Ok(RowCounts {
            documents,
            chunks,
            chunk_vectors,
            document_vectors,
            fingerprints: 0,
        })
    }

    /// Remove every document, chunk and vector, and drop the vector tables.
    /// Used when a folder changes to a model of another dimension.
    pub async fn reset(&self) -> Result<()> {
        let (chunk_tables, doc_tables) = self.vector_tables().await?;
        let mut tx = self.pool.begin().await?;
        for table in chunk_tables.iter().chain(doc_tables.iter()) {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM documents").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM meta WHERE key IN (?, ?)")
            .bind(META_DIMS)
            .bind(META_MODEL)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_table(&self, name: &str) -> Result<bool> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(n > 0)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn is_vector_table_name(name: &str) -> bool {
    let suffix = name
        .strip_prefix("chunk_vectors_")
        .or_else(|| name.strip_prefix("document_vectors_"));
    matches!(suffix, Some(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Document {
    let size: i64 = row.get("size");
    let indexed: i64 = row.get("indexed");
    Document {
        id: row.get("id"),
        path: row.get("path"),
        fingerprint: Fingerprint {
            size: size as u64,
            mtime_ms: row.get("mtime_ms"),
            content_hash: row.get("content_hash"),
        },
        indexed: indexed != 0,
        modified_at: row.get("modified_at"),
        chunk_count: row.get("chunk_count"),
    }
}

fn row_to_chunk_record(row: &sqlx::sqlite::SqliteRow) -> ChunkRecord {
    ChunkRecord {
        chunk_id: row.get("chunk_id"),
        document_id: row.get("document_id"),
        path: row.get("path"),
        chunk_index: row.get("chunk_index"),
        start: row.get("start_offset"),
        end: row.get("end_offset"),
        text: row.get("text"),
    }
}

/// Stable directory name for a folder's private storage.
pub fn storage_key(folder: &Path) -> String {
    let digest = Sha256::digest(folder.to_string_lossy().as_bytes());
    hex::encode(&digest[..8])
}

/// A folder's private storage directory and the stores inside it.
pub struct FolderStorage {
    dir: PathBuf,
    pub vectors: VectorStore,
    pub fingerprints: FingerprintStore,
}

impl FolderStorage {
    pub async fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| IndexError::io(format!("create {}", dir.display()), e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            vectors: VectorStore::open(&dir.join(INDEX_DB)).await?,
            fingerprints: FingerprintStore::open(&dir.join(FINGERPRINT_DB)).await?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn row_counts(&self) -> Result<RowCounts> {
        let mut counts = self.vectors.counts().await?;
        counts.fingerprints = self.fingerprints.count().await?;
        Ok(counts)
    }

    /// Delete every row this folder owns: vectors, chunks, documents and
    /// fingerprints. Returns the counts left afterwards (all zero).
    pub async fn purge(&self) -> Result<RowCounts> {
        self.vectors.reset().await?;
        self.fingerprints.clear().await?;
        self.row_counts().await
    }

    /// Purge, close both stores and delete the directory.
    pub async fn destroy(&self) -> Result<()> {
        let counts = self.purge().await?;
        if !counts.is_empty() {
            return Err(IndexError::FatalStorage(format!(
                "rows survived purge of {}: {:?}",
                self.dir.display(),
                counts
            )));
        }
        self.vectors.close().await;
        self.fingerprints.close().await;
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IndexError::io(format!("remove {}", self.dir.display()), e)),
        }
    }
}
