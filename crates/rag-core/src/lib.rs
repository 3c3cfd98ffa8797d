//! rag-core - Core types and traits for the query pipeline
//!
//! This crate provides the foundational types, collaborator traits, error
//! handling and configuration shared by every other crate in the workspace.

pub mod config;
pub mod error;
pub mod pool;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::{RagError, Result};
pub use pool::BlockingPool;
pub use traits::*;
pub use types::*;
