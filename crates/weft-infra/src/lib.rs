//! Infrastructure layer for Weft.
//!
//! Contains implementations of the ports defined in `weft-core`: SQLite
//! document storage, an HTTP CloudEvent sink, and the configuration loader.

pub mod config;
pub mod http;
pub mod sqlite;
