//! In-memory implementations of the repository ports.
//!
//! Used by the stand-alone runtime and as test fakes. The resource store
//! supports injecting optimistic-concurrency conflicts and dropping every
//! open watch, to exercise the runtime's recovery paths.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use futures_util::stream::BoxStream;
use json_patch::Patch;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::error::RepositoryError;
use weft_types::event::CloudEvent;
use weft_types::resource::{Resource, ResourceWatchEvent, ResourceWatchEventType};

use super::document::DocumentRepository;
use super::publisher::CloudEventPublisher;
use super::resource::ResourceRepository;

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Document store backed by a concurrent hash map.
#[derive(Debug, Default)]
pub struct MemoryDocumentRepository {
    documents: DashMap<String, (String, Value)>,
}

impl MemoryDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl DocumentRepository for MemoryDocumentRepository {
    async fn create(&self, name: &str, content: &Value) -> Result<String, RepositoryError> {
        let id = Uuid::now_v7().simple().to_string();
        self.documents
            .insert(id.clone(), (name.to_string(), content.clone()));
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Value, RepositoryError> {
        self.documents
            .get(id)
            .map(|entry| entry.1.clone())
            .ok_or(RepositoryError::NotFound)
    }

    async fn update(&self, id: &str, content: &Value) -> Result<(), RepositoryError> {
        let mut entry = self.documents.get_mut(id).ok_or(RepositoryError::NotFound)?;
        entry.1 = content.clone();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Resource store with versioning and change notifications.
pub struct MemoryResourceRepository<R: Resource> {
    resources: DashMap<(String, String), R>,
    changes: broadcast::Sender<ResourceWatchEvent<R>>,
    /// Cancelled to sever every open watch stream.
    connection: Mutex<CancellationToken>,
    pending_conflicts: AtomicUsize,
}

impl<R: Resource> MemoryResourceRepository<R> {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            resources: DashMap::new(),
            changes,
            connection: Mutex::new(CancellationToken::new()),
            pending_conflicts: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` versioned status patches fail with `Conflict`.
    pub fn inject_conflicts(&self, count: usize) {
        self.pending_conflicts.fetch_add(count, Ordering::SeqCst);
    }

    /// End every open watch stream, as if the connection dropped.
    pub fn disconnect_watchers(&self) {
        if let Ok(mut connection) = self.connection.lock() {
            connection.cancel();
            *connection = CancellationToken::new();
        }
    }

    /// Replace a resource's status wholesale, bumping its version and
    /// notifying watchers. Stands in for writes by other processes.
    pub fn replace_status(
        &self,
        namespace: &str,
        name: &str,
        update: impl FnOnce(&mut R::Status),
    ) -> Result<R, RepositoryError> {
        let updated = {
            let mut entry = self
                .resources
                .get_mut(&key(namespace, name))
                .ok_or(RepositoryError::NotFound)?;
            update(entry.status_mut());
            entry.metadata_mut().resource_version += 1;
            entry.value().clone()
        };
        self.notify(ResourceWatchEventType::Updated, updated.clone());
        Ok(updated)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn notify(&self, event_type: ResourceWatchEventType, resource: R) {
        let _ = self.changes.send(ResourceWatchEvent {
            event_type,
            resource,
        });
    }

    fn take_injected_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<R: Resource> Default for MemoryResourceRepository<R> {
    fn default() -> Self {
        Self::new()
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

impl<R: Resource> ResourceRepository<R> for MemoryResourceRepository<R> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<R>, RepositoryError> {
        Ok(self
            .resources
            .get(&key(namespace, name))
            .map(|entry| entry.value().clone()))
    }

    async fn create(&self, resource: &R) -> Result<R, RepositoryError> {
        let meta = resource.metadata();
        let created = match self.resources.entry(key(&meta.namespace, &meta.name)) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RepositoryError::AlreadyExists(meta.qualified_name()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let mut stored = resource.clone();
                stored.metadata_mut().resource_version = 1;
                slot.insert(stored.clone());
                stored
            }
        };
        self.notify(ResourceWatchEventType::Created, created.clone());
        Ok(created)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Patch,
        expected_version: Option<u64>,
    ) -> Result<R, RepositoryError> {
        let updated = {
            let mut entry = self
                .resources
                .get_mut(&key(namespace, name))
                .ok_or(RepositoryError::NotFound)?;

            if let Some(expected) = expected_version {
                if self.take_injected_conflict() {
                    return Err(RepositoryError::Conflict("injected".to_string()));
                }
                let actual = entry.metadata().resource_version;
                if actual != expected {
                    return Err(RepositoryError::Conflict(format!(
                        "expected version {expected}, found {actual}"
                    )));
                }
            }

            let mut status = serde_json::to_value(entry.status())
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            json_patch::patch(&mut status, &patch.0)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            *entry.status_mut() =
                serde_json::from_value(status).map_err(|e| RepositoryError::Query(e.to_string()))?;
            entry.metadata_mut().resource_version += 1;
            entry.value().clone()
        };
        self.notify(ResourceWatchEventType::Updated, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), RepositoryError> {
        let (_, removed) = self
            .resources
            .remove(&key(namespace, name))
            .ok_or(RepositoryError::NotFound)?;
        self.notify(ResourceWatchEventType::Deleted, removed);
        Ok(())
    }

    fn monitor(
        &self,
        namespace: &str,
        name: &str,
    ) -> BoxStream<'static, Result<ResourceWatchEvent<R>, RepositoryError>> {
        let mut receiver = self.changes.subscribe();
        let connection = self
            .connection
            .lock()
            .map(|token| token.clone())
            .unwrap_or_else(|_| CancellationToken::new());
        let namespace = namespace.to_string();
        let name = name.to_string();

        Box::pin(async_stream::stream! {
            loop {
                let received = tokio::select! {
                    _ = connection.cancelled() => break,
                    received = receiver.recv() => received,
                };
                match received {
                    Ok(event) => {
                        let meta = event.resource.metadata();
                        if meta.namespace == namespace && meta.name == name {
                            yield Ok::<_, RepositoryError>(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "resource watch lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Publisher that records every event it is handed.
#[derive(Debug, Default, Clone)]
pub struct MemoryCloudEventPublisher {
    events: Arc<Mutex<Vec<CloudEvent>>>,
}

impl MemoryCloudEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    pub fn events(&self) -> Vec<CloudEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Published event types, in order.
    pub fn event_types(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.type_).collect()
    }
}

impl CloudEventPublisher for MemoryCloudEventPublisher {
    async fn publish(&self, event: &CloudEvent) -> Result<(), RepositoryError> {
        self.events
            .lock()
            .map_err(|_| RepositoryError::Connection)?
            .push(event.clone());
        Ok(())
    }
}
