//! rag-store - SQLite corpus store
//!
//! Persists documents, chunks and chunk embeddings. The store doubles as
//! the dense retrieval index (exact cosine scan) and as the corpus source
//! the sparse index is rebuilt from.

mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

// Re-export schema for testing/migrations
pub use schema::{SCHEMA, SCHEMA_VERSION};
