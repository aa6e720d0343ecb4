//! Shared domain types for Weft.
//!
//! This crate contains the data model used across the Weft workflow engine:
//! workflow definitions, workflow/task instances, correlations, CloudEvents
//! and the lifecycle vocabulary, engine configuration, and error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod correlation;
pub mod definition;
pub mod error;
pub mod event;
pub mod instance;
pub mod resource;
pub mod workflow;
