//! Per-resource concurrency limits.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("bulkhead '{0}' is closed")]
pub struct BulkheadClosed(pub &'static str);

/// A named semaphore bounding in-flight work against one resource class.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    name: &'static str,
    semaphore: Arc<Semaphore>,
}

impl Bulkhead {
    pub fn new(name: &'static str, permits: usize) -> Self {
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(permits.max(1))),
        }
    }

    /// Wait for a slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadClosed> {
        if self.semaphore.available_permits() == 0 {
            trace!(bulkhead = self.name, "bulkhead saturated, waiting for a slot");
        }
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| BulkheadClosed(self.name))
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// One bulkhead per resource class, sized independently.
#[derive(Debug, Clone)]
pub struct Bulkheads {
    pub remote: Bulkhead,
    pub cache: Bulkhead,
    pub alert: Bulkhead,
}

impl Bulkheads {
    pub fn new(remote: usize, cache: usize, alert: usize) -> Self {
        Self {
            remote: Bulkhead::new("remote", remote),
            cache: Bulkhead::new("cache", cache),
            alert: Bulkhead::new("alert", alert),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saturating_one_class_leaves_others_free() {
        let bulkheads = Bulkheads::new(1, 2, 1);

        let _held = bulkheads.remote.acquire().await.expect("remote slot");
        assert_eq!(bulkheads.remote.available(), 0);

        let cache_permit = bulkheads.cache.acquire().await.expect("cache slot");
        assert_eq!(bulkheads.cache.available(), 1);
        drop(cache_permit);
        assert_eq!(bulkheads.cache.available(), 2);
        assert_eq!(bulkheads.alert.available(), 1);
    }

    #[test]
    fn zero_sized_bulkheads_still_admit_one() {
        assert_eq!(Bulkhead::new("remote", 0).available(), 1);
    }
}
