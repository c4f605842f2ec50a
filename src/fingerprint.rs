//! Content Fingerprint Store.
//!
//! Durable record of what has been indexed: one row per document path with
//! the size, mtime and SHA-256 of the bytes that were last committed. A row
//! is written only after the document's chunks and vectors are committed,
//! so a crash mid-run leaves the document looking changed and it is picked
//! up again on the next pass.

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::time::SystemTime;

use crate::db;
use crate::error::{IndexError, Result};
use crate::migrate;
use crate::models::Fingerprint;

pub struct FingerprintStore {
    pool: SqlitePool,
}

impl FingerprintStore {
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = db::connect(db_path).await?;
        migrate::migrate_fingerprints(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn load_all(&self) -> Result<HashMap<String, Fingerprint>> {
        let rows = sqlx::query("SELECT path, size, mtime_ms, content_hash FROM fingerprints")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let size: i64 = row.get("size");
                (
                    row.get::<String, _>("path"),
                    Fingerprint {
                        size: size as u64,
                        mtime_ms: row.get("mtime_ms"),
                        content_hash: row.get("content_hash"),
                    },
                )
            })
            .collect())
    }

    pub async fn get(&self, path: &str) -> Result<Option<Fingerprint>> {
        let row = sqlx::query("SELECT size, mtime_ms, content_hash FROM fingerprints WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| {
            let size: i64 = row.get("size");
            Fingerprint {
                size: size as u64,
                mtime_ms: row.get("mtime_ms"),
                content_hash: row.get("content_hash"),
            }
        }))
    }

    pub async fn upsert(&self, path: &str, fp: &Fingerprint) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO fingerprints (path, size, mtime_ms, content_hash, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                size = excluded.size,
                mtime_ms = excluded.mtime_ms,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(path)
        .bind(fp.size as i64)
        .bind(fp.mtime_ms)
        .bind(&fp.content_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM fingerprints WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM fingerprints")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fingerprints")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Size and mtime (ms) of a file, without reading its content.
pub fn stat(path: &Path) -> std::io::Result<(u64, i64)> {
    let metadata = std::fs::metadata(path)?;
    let mtime_ms = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    Ok((metadata.len(), mtime_ms))
}

/// Compute the full fingerprint of a file, hashing its bytes.
pub fn compute(path: &Path) -> Result<Fingerprint> {
    let (size, mtime_ms) =
        stat(path).map_err(|e| IndexError::io(format!("stat {}", path.display()), e))?;
    let content_hash =
        hash_file(path).map_err(|e| IndexError::io(format!("read {}", path.display()), e))?;
    Ok(Fingerprint {
        size,
        mtime_ms,
        content_hash,
    })
}

pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
