//! Persisted list of watched folders.
//!
//! Lives at `<data_dir>/catalog.sqlite`. On start the manager resumes every
//! folder listed here with an incremental pass.

use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

use crate::db;
use crate::error::Result;
use crate::migrate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub path: PathBuf,
    /// Name of the folder's private storage directory under `folders/`.
    pub storage_key: String,
    pub model_id: String,
    pub added_at: i64,
    pub updated_at: i64,
}

pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::migrate_catalog(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn list(&self) -> Result<Vec<CatalogEntry>> {
        let rows = sqlx::query(
            "SELECT path, storage_key, model_id, added_at, updated_at FROM folders ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_entry).collect())
    }

    pub async fn get(&self, path: &Path) -> Result<Option<CatalogEntry>> {
        let row = sqlx::query(
            "SELECT path, storage_key, model_id, added_at, updated_at FROM folders WHERE path = ?",
        )
        .bind(path.to_string_lossy().to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_entry))
    }

    pub async fn insert(&self, path: &Path, storage_key: &str, model_id: &str) -> Result<CatalogEntry> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO folders (path, storage_key, model_id, added_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                model_id = excluded.model_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(path.to_string_lossy().to_string())
        .bind(storage_key)
        .bind(model_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(CatalogEntry {
            path: path.to_path_buf(),
            storage_key: storage_key.to_string(),
            model_id: model_id.to_string(),
            added_at: now,
            updated_at: now,
        })
    }

    pub async fn set_model(&self, path: &Path, model_id: &str) -> Result<()> {
        sqlx::query("UPDATE folders SET model_id = ?, updated_at = ? WHERE path = ?")
            .bind(model_id)
            .bind(chrono::Utc::now().timestamp())
            .bind(path.to_string_lossy().to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove(&self, path: &Path) -> Result<bool> {
        let result = sqlx::query("DELETE FROM folders WHERE path = ?")
            .bind(path.to_string_lossy().to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> CatalogEntry {
    let path: String = row.get("path");
    CatalogEntry {
        path: PathBuf::from(path),
        storage_key: row.get("storage_key"),
        model_id: row.get("model_id"),
        added_at: row.get("added_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn entries_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("catalog.sqlite");

        let catalog = Catalog::open(&db).await.unwrap();
        catalog
            .insert(Path::new("/home/me/notes"), "abc", "all-minilm-l6-v2")
            .await
            .unwrap();
        catalog
            .set_model(Path::new("/home/me/notes"), "bge-small-en-v1.5")
            .await
            .unwrap();
        catalog.close().await;

        let catalog = Catalog::open(&db).await.unwrap();
        let entries = catalog.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].storage_key, "abc");
        assert_eq!(entries[0].model_id, "bge-small-en-v1.5");

        assert!(catalog.remove(Path::new("/home/me/notes")).await.unwrap());
        assert!(!catalog.remove(Path::new("/home/me/notes")).await.unwrap());
        assert!(catalog.get(Path::new("/home/me/notes")).await.unwrap().is_none());
    }
}
