//! Document repository trait definition.
//!
//! Documents are opaque JSON blobs (task inputs, outputs, context data)
//! addressed by an id assigned at creation.

use std::future::Future;

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_types::error::RepositoryError;

/// Storage for JSON documents.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DocumentRepository: Send + Sync {
    /// Store `content` and return its id. `name` is a human-readable label.
    fn create(
        &self,
        name: &str,
        content: &Value,
    ) -> impl Future<Output = Result<String, RepositoryError>> + Send;

    /// Fetch a document by id. Returns `NotFound` if it does not exist.
    fn get(&self, id: &str) -> impl Future<Output = Result<Value, RepositoryError>> + Send;

    /// Replace the content of an existing document.
    fn update(
        &self,
        id: &str,
        content: &Value,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}

/// Object-safe version of [`DocumentRepository`] with boxed futures.
pub trait DocumentRepositoryDyn: Send + Sync {
    fn create_boxed<'a>(
        &'a self,
        name: &'a str,
        content: &'a Value,
    ) -> BoxFuture<'a, Result<String, RepositoryError>>;

    fn get_boxed<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Value, RepositoryError>>;

    fn update_boxed<'a>(
        &'a self,
        id: &'a str,
        content: &'a Value,
    ) -> BoxFuture<'a, Result<(), RepositoryError>>;
}

impl<T: DocumentRepository> DocumentRepositoryDyn for T {
    fn create_boxed<'a>(
        &'a self,
        name: &'a str,
        content: &'a Value,
    ) -> BoxFuture<'a, Result<String, RepositoryError>> {
        Box::pin(self.create(name, content))
    }

    fn get_boxed<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Value, RepositoryError>> {
        Box::pin(self.get(id))
    }

    fn update_boxed<'a>(
        &'a self,
        id: &'a str,
        content: &'a Value,
    ) -> BoxFuture<'a, Result<(), RepositoryError>> {
        Box::pin(self.update(id, content))
    }
}
