//! Parallel Processing Module
//!
//! Bounded worker group shared by model preloading and clip acquisition.
//! A semaphore caps how many jobs run at once; results are merged through a
//! single completion channel in the order jobs finish.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use crate::core::{CoreError, CoreResult};

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Configured capacity
    pub capacity: usize,
    /// Currently running jobs
    pub running: usize,
    /// Peak concurrent jobs observed
    pub peak_concurrent: usize,
}

/// A reserved execution slot. Releases its permit on drop.
#[derive(Debug)]
pub struct PoolSlot {
    _permit: OwnedSemaphorePermit,
    running: Arc<AtomicUsize>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Semaphore-bounded worker group
#[derive(Debug, Clone)]
pub struct BoundedPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl BoundedPool {
    /// Creates a pool running at most `capacity` jobs at once (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently running jobs
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            running: self.running(),
            peak_concurrent: self.peak.load(Ordering::SeqCst),
        }
    }

    /// Reserves a slot if one is free right now
    pub fn try_reserve(&self) -> Option<PoolSlot> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.occupy(permit))
    }

    /// Waits for a free slot
    pub async fn reserve(&self) -> CoreResult<PoolSlot> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| CoreError::Internal(format!("Worker pool closed: {}", e)))?;
        Ok(self.occupy(permit))
    }

    fn occupy(&self, permit: OwnedSemaphorePermit) -> PoolSlot {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        PoolSlot {
            _permit: permit,
            running: self.running.clone(),
        }
    }

    /// Runs every job on the pool and returns all outcomes in completion order.
    ///
    /// A job that panics yields `Err` with the panic message; other jobs are
    /// unaffected.
    pub async fn run_all<K, T, F>(&self, jobs: Vec<(K, F)>) -> Vec<(K, Result<T, String>)>
    where
        K: Send + 'static,
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let total = jobs.len();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for (key, job) in jobs {
            let pool = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = match pool.reserve().await {
                    Ok(slot) => tokio::spawn(async move {
                        let _slot = slot;
                        job.await
                    })
                    .await
                    .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                let _ = tx.send((key, outcome));
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(total);
        while let Some(entry) = rx.recv().await {
            results.push(entry);
        }
        results
    }
}

// ============================================================================
// Tests
// ============================================================================
