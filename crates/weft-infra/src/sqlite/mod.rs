//! SQLite storage layer.
//!
//! Document storage backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod document;
pub mod pool;

pub use document::SqliteDocumentRepository;
pub use pool::DatabasePool;
