//! Resource repository trait definition.
//!
//! Resources (workflow instances, workflows, correlations) are addressed by
//! namespace and name, carry a `resource_version` for optimistic
//! concurrency, and can be watched for changes.

use std::future::Future;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use json_patch::Patch;
use weft_types::error::RepositoryError;
use weft_types::resource::{Resource, ResourceWatchEvent};

/// Storage for resources of kind `R`.
pub trait ResourceRepository<R: Resource>: Send + Sync {
    /// Fetch a resource. Returns `Ok(None)` if it does not exist.
    fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<R>, RepositoryError>> + Send;

    /// Create a resource. Returns `AlreadyExists` if the name is taken.
    fn create(&self, resource: &R) -> impl Future<Output = Result<R, RepositoryError>> + Send;

    /// Apply an RFC 6902 patch to the resource's status.
    ///
    /// When `expected_version` is given and does not match the stored
    /// `resource_version`, the store answers `Conflict` and nothing changes.
    fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Patch,
        expected_version: Option<u64>,
    ) -> impl Future<Output = Result<R, RepositoryError>> + Send;

    fn delete(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Watch one resource for changes. The stream ends when the underlying
    /// connection drops; callers re-subscribe.
    fn monitor(
        &self,
        namespace: &str,
        name: &str,
    ) -> BoxStream<'static, Result<ResourceWatchEvent<R>, RepositoryError>>;
}

/// Object-safe version of [`ResourceRepository`].
pub trait ResourceRepositoryDyn<R: Resource>: Send + Sync {
    fn get_boxed<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<R>, RepositoryError>>;

    fn create_boxed<'a>(&'a self, resource: &'a R) -> BoxFuture<'a, Result<R, RepositoryError>>;

    fn patch_status_boxed<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        patch: &'a Patch,
        expected_version: Option<u64>,
    ) -> BoxFuture<'a, Result<R, RepositoryError>>;

    fn delete_boxed<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), RepositoryError>>;

    fn monitor_boxed(
        &self,
        namespace: &str,
        name: &str,
    ) -> BoxStream<'static, Result<ResourceWatchEvent<R>, RepositoryError>>;
}

impl<R: Resource, T: ResourceRepository<R>> ResourceRepositoryDyn<R> for T {
    fn get_boxed<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<R>, RepositoryError>> {
        Box::pin(self.get(namespace, name))
    }

    fn create_boxed<'a>(&'a self, resource: &'a R) -> BoxFuture<'a, Result<R, RepositoryError>> {
        Box::pin(self.create(resource))
    }

    fn patch_status_boxed<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        patch: &'a Patch,
        expected_version: Option<u64>,
    ) -> BoxFuture<'a, Result<R, RepositoryError>> {
        Box::pin(self.patch_status(namespace, name, patch, expected_version))
    }

    fn delete_boxed<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), RepositoryError>> {
        Box::pin(self.delete(namespace, name))
    }

    fn monitor_boxed(
        &self,
        namespace: &str,
        name: &str,
    ) -> BoxStream<'static, Result<ResourceWatchEvent<R>, RepositoryError>> {
        self.monitor(namespace, name)
    }
}

/// Read-modify-write a resource's status, retrying on optimistic
/// concurrency conflicts until the write lands.
///
/// Returns `Ok(None)` if the resource does not exist. Conflicts never
/// surface to the caller; any other error does.
pub async fn update_status_with_retry<R, F>(
    repository: &dyn ResourceRepositoryDyn<R>,
    namespace: &str,
    name: &str,
    mut mutate: F,
) -> Result<Option<R>, RepositoryError>
where
    R: Resource,
    F: FnMut(&mut R::Status) + Send,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let Some(current) = repository.get_boxed(namespace, name).await? else {
            return Ok(None);
        };

        let before = serde_json::to_value(current.status())
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let mut status = current.status().clone();
        mutate(&mut status);
        let after =
            serde_json::to_value(&status).map_err(|e| RepositoryError::Query(e.to_string()))?;

        let patch = json_patch::diff(&before, &after);
        if patch.0.is_empty() {
            return Ok(Some(current));
        }

        let expected = current.metadata().resource_version;
        match repository
            .patch_status_boxed(namespace, name, &patch, Some(expected))
            .await
        {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_conflict() => {
                tracing::debug!(
                    kind = R::KIND,
                    namespace,
                    name,
                    attempt,
                    "status update conflicted, retrying"
                );
            }
            Err(e) => return Err(e),
        }
    }
}
