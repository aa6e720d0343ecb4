//! Workflow execution runtime and repository trait definitions for Weft.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, in-memory adapters for them, and the execution runtime
//! itself. It depends only on `weft-types` -- never on `weft-infra` or any
//! database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
