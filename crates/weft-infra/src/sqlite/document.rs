//! SQLite document repository.
//!
//! Implements `DocumentRepository` from `weft-core`. Documents are stored as
//! JSON text and deserialized on read.

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;
use weft_core::repository::DocumentRepository;
use weft_types::error::RepositoryError;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `DocumentRepository`.
pub struct SqliteDocumentRepository {
    pool: DatabasePool,
}

impl SqliteDocumentRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn to_json_text(content: &Value) -> Result<String, RepositoryError> {
    serde_json::to_string(content)
        .map_err(|e| RepositoryError::Query(format!("failed to serialize document: {e}")))
}

impl DocumentRepository for SqliteDocumentRepository {
    async fn create(&self, name: &str, content: &Value) -> Result<String, RepositoryError> {
        let id = Uuid::now_v7().simple().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO documents (id, name, content, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(to_json_text(content)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        tracing::debug!(document = %id, name, "document created");
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Value, RepositoryError> {
        let row = sqlx::query("SELECT content FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?
            .ok_or(RepositoryError::NotFound)?;
        let content: String = row.try_get("content").map_err(query_error)?;
        serde_json::from_str(&content)
            .map_err(|e| RepositoryError::Query(format!("invalid JSON document: {e}")))
    }

    async fn update(&self, id: &str, content: &Value) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE documents SET content = ?, updated_at = ? WHERE id = ?")
            .bind(to_json_text(content)?)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use weft_core::repository::DocumentRepositoryDyn;

    use super::*;
    use crate::sqlite::pool::database_url;

    async fn repository() -> (tempfile::TempDir, SqliteDocumentRepository) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&database_url(dir.path())).await.unwrap();
        (dir, SqliteDocumentRepository::new(pool))
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let (_dir, repo) = repository().await;
        let content = json!({"order": {"id": "A-1", "lines": [1, 2, 3]}});
        let id = repo.create("input", &content).await.unwrap();
        assert_eq!(repo.get(&id).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_update_replaces_content() {
        let (_dir, repo) = repository().await;
        let id = repo.create("context", &json!({})).await.unwrap();
        repo.update(&id, &json!({"approved": true})).await.unwrap();
        assert_eq!(repo.get(&id).await.unwrap(), json!({"approved": true}));
    }

    #[tokio::test]
    async fn test_missing_document_is_not_found() {
        let (_dir, repo) = repository().await;
        assert_eq!(repo.get("nope").await, Err(RepositoryError::NotFound));
        assert_eq!(
            repo.update("nope", &json!(1)).await,
            Err(RepositoryError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_usable_as_runtime_document_store() {
        let (_dir, repo) = repository().await;
        let documents: Arc<dyn DocumentRepositoryDyn> = Arc::new(repo);
        let id = documents.create_boxed("output", &json!("done")).await.unwrap();
        assert_eq!(documents.get_boxed(&id).await.unwrap(), json!("done"));
    }
}
