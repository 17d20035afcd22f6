//! Global execution concurrency ceiling.
//!
//! A FIFO semaphore: runs that cannot get a permit stay `pending` and are
//! admitted in arrival order as permits free up. Nothing is dropped.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::metrics;

pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        let capacity = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a permit. Tokio's semaphore is fair, so waiters are served
    /// in the order they arrived.
    pub async fn acquire(&self) -> Result<ExecutionPermit> {
        metrics::inc_queued_executions();
        let permit = self.semaphore.clone().acquire_owned().await;
        metrics::dec_queued_executions();

        let permit =
            permit.map_err(|_| Error::Internal("Concurrency limiter closed".to_string()))?;
        metrics::inc_active_executions();
        Ok(ExecutionPermit {
            permit: Some(permit),
        })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Slot held by a running execution, released on drop.
pub struct ExecutionPermit {
    permit: Option<OwnedSemaphorePermit>,
}

impl ExecutionPermit {
    /// Permit for a child run the parent waits on synchronously. It rides
    /// on the parent's slot, so a full pool cannot deadlock the pair.
    pub fn inherited() -> Self {
        Self { permit: None }
    }

    pub fn is_inherited(&self) -> bool {
        self.permit.is_none()
    }
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        if self.permit.take().is_some() {
            metrics::dec_active_executions();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_permits_are_released_on_drop() {
        let limiter = ConcurrencyLimiter::new(2);
        let a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(blocked.is_err());

        drop(a);
        assert_eq!(limiter.available(), 1);
        let c = limiter.acquire().await.unwrap();
        assert!(!c.is_inherited());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(ConcurrencyLimiter::new(0).capacity(), 1);
        assert!(ExecutionPermit::inherited().is_inherited());
    }
}
