//! HTTP adapters.

pub mod publisher;

pub use publisher::HttpCloudEventPublisher;
