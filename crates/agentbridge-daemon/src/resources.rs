//! Bounded concurrency gate for in-flight artifacts.

use std::sync::Arc;

use agentbridge_core::{Error, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_MAX_CONCURRENT: usize = 3;

#[derive(Clone)]
pub struct ResourceManager {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

/// One acquired slot. Dropping it releases the slot, whichever way the
/// holder exits.
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct ResourceGuard {
    _permit: OwnedSemaphorePermit,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl ResourceManager {
    pub fn new(max_concurrent: usize) -> Result<Self> {
        if max_concurrent == 0 {
            return Err(Error::config("max_concurrent must be at least 1"));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        })
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<ResourceGuard> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Fatal("resource manager closed".into()))?;
        Ok(ResourceGuard { _permit: permit })
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<ResourceGuard> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| ResourceGuard { _permit: permit })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.available()
    }
}
