//! Bounded-concurrency batch execution
//!
//! A [`BatchExecutor`] owns one semaphore, so concurrent batches share the
//! same in-flight limit. Output order always matches input order.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use metrics::histogram;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::debug;

use mcp_client::ToolCallResult;

/// Anything a batch can count as a success or a failure
pub trait BatchOutcome {
    fn is_success(&self) -> bool;
}

impl BatchOutcome for ToolCallResult {
    fn is_success(&self) -> bool {
        self.success
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub batches: u64,
    pub items: u64,
    pub failures: u64,
    /// Highest number of items observed in flight at once
    pub peak_in_flight: usize,
}

pub struct BatchExecutor {
    limit: usize,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    batches: AtomicU64,
    items: AtomicU64,
    failures: AtomicU64,
}

impl BatchExecutor {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            batches: AtomicU64::new(0),
            items: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `task` over every item with at most `limit` in flight
    pub async fn run<I, F, Fut, T>(&self, items: Vec<I>, task: F) -> Vec<T>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = T>,
        T: BatchOutcome,
    {
        let count = items.len();
        debug!(count, limit = self.limit, "Running batch");
        histogram!("mcp_batch_size", count as f64);

        let futures = items.into_iter().map(|item| {
            let work = task(item);
            let semaphore = Arc::clone(&self.semaphore);
            async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
                let outcome = work.await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                outcome
            }
        });
        let results = join_all(futures).await;

        let failed = results.iter().filter(|r| !r.is_success()).count();
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.items.fetch_add(count as u64, Ordering::Relaxed);
        self.failures.fetch_add(failed as u64, Ordering::Relaxed);
        results
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            batches: self.batches.load(Ordering::Relaxed),
            items: self.items.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }
}
