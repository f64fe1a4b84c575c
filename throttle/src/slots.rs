use std::sync::Arc;

/// Fixed-size pool of concurrency slots.
///
/// A [`Slot`] is an owned permit: it can be moved into a spawned task and is returned to the
/// pool when dropped, whichever way the task ends.
#[derive(Debug, Clone)]
pub struct Slots {
    limit: usize,
    sem: Arc<tokio::sync::Semaphore>,
}

#[derive(Debug)]
pub struct Slot {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Slots {
    /// Create a pool with `limit` slots. A limit of 0 is raised to 1.
    pub fn new(limit: usize) -> Self {
        let limit = std::cmp::max(1, limit);
        Self {
            limit,
            sem: Arc::new(tokio::sync::Semaphore::new(limit)),
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<Slot, tokio::sync::AcquireError> {
        let permit = self.sem.clone().acquire_owned().await?;
        tracing::trace!("slot acquired, {} in use", self.in_use());
        Ok(Slot { _permit: permit })
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<Slot> {
        self.sem
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Slot { _permit: permit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_use(&self) -> usize {
        self.limit - self.sem.available_permits()
    }
}
