//! In-process CloudEvent distribution.
//!
//! Provides a `CloudEventBus` that distributes `CloudEvent`s to all
//! subscribers via a `tokio::sync::broadcast` channel. The stand-alone
//! runtime correlates `listen` tasks against it.

pub mod bus;

pub use bus::CloudEventBus;
