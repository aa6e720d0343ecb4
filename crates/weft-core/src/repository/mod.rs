//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (weft-infra) implements. The core crate never depends on any specific
//! storage technology.
//!
//! Each port comes as a pair: a native async trait (RPITIT) that adapters
//! implement, and an object-safe `*Dyn` twin with boxed futures that the
//! runtime holds behind `Arc<dyn ...>`. The `*Dyn` traits are blanket
//! implemented, so adapters only ever write the first.

pub mod document;
pub mod memory;
pub mod publisher;
pub mod resource;

pub use document::{DocumentRepository, DocumentRepositoryDyn};
pub use publisher::{CloudEventPublisher, CloudEventPublisherDyn};
pub use resource::{ResourceRepository, ResourceRepositoryDyn, update_status_with_retry};
