//! Schema migrations for the three SQLite files the engine owns:
//! the per-folder index, the per-folder fingerprint store, and the
//! daemon-wide folder catalog.
//!
//! Vector tables are created per embedding dimension and carry no
//! foreign keys, mirroring vector extensions that cannot enforce them;
//! their rows are deleted explicitly alongside the owning chunk or
//! document.

use sqlx::SqlitePool;

use crate::error::Result;

pub async fn migrate_index(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            size INTEGER NOT NULL,
            mtime_ms INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            indexed INTEGER NOT NULL DEFAULT 0,
            modified_at INTEGER NOT NULL,
            indexed_at INTEGER NOT NULL,
            chunk_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            key_phrases TEXT NOT NULL DEFAULT '[]',
            readability REAL NOT NULL DEFAULT 0,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the chunk- and document-level vector tables for `dims`.
pub async fn ensure_vector_tables(pool: &SqlitePool, dims: usize) -> Result<()> {
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
        chunk_vector_table(dims)
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{0}_document_id ON {0}(document_id)",
        chunk_vector_table(dims)
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            document_id TEXT PRIMARY KEY,
            embedding BLOB NOT NULL
        )
        "#,
        document_vector_table(dims)
    ))
    .execute(pool)
    .await?;

    Ok(())
}

pub fn chunk_vector_table(dims: usize) -> String {
    format!("chunk_vectors_{}", dims)
}

pub fn document_vector_table(dims: usize) -> String {
    format!("document_vectors_{}", dims)
}

pub async fn migrate_fingerprints(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fingerprints (
            path TEXT PRIMARY KEY,
            size INTEGER NOT NULL,
            mtime_ms INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn migrate_catalog(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS folders (
            path TEXT PRIMARY KEY,
            storage_key TEXT NOT NULL UNIQUE,
            model_id TEXT NOT NULL,
            added_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
