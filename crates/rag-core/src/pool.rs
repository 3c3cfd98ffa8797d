//! Bounded pool for CPU-bound work.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{RagError, Result};

/// Runs closures on tokio's blocking threads, at most `workers` at a time.
///
/// Lexical scoring, index rebuilds and brute-force vector scans go through
/// here so they never occupy the async worker threads.
#[derive(Clone, Debug)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl BlockingPool {
    /// Create a pool allowing `workers` concurrent jobs (minimum 1).
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    /// Maximum number of concurrent jobs.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `f` on a blocking thread once a permit is available.
    pub async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| RagError::internal(format!("Worker pool closed: {}", e)))?;

        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| RagError::internal(format!("Blocking task failed: {}", e)))
    }
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(4)
    }
}
