//! CloudEvent publisher trait definition.

use std::future::Future;

use futures_util::future::BoxFuture;
use weft_types::error::RepositoryError;
use weft_types::event::CloudEvent;

/// Outbound CloudEvent sink. Publication is fire-and-forget from the
/// engine's point of view: callers log failures and carry on.
pub trait CloudEventPublisher: Send + Sync {
    fn publish(
        &self,
        event: &CloudEvent,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}

/// Object-safe version of [`CloudEventPublisher`].
pub trait CloudEventPublisherDyn: Send + Sync {
    fn publish_boxed<'a>(&'a self, event: &'a CloudEvent) -> BoxFuture<'a, Result<(), RepositoryError>>;
}

impl<T: CloudEventPublisher> CloudEventPublisherDyn for T {
    fn publish_boxed<'a>(&'a self, event: &'a CloudEvent) -> BoxFuture<'a, Result<(), RepositoryError>> {
        Box::pin(self.publish(event))
    }
}
