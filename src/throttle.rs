use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Process-wide cap on simultaneous LLM-bound work. All rooms contend for
/// the same slots, FIFO. Slots are RAII guards, so release happens on every
/// exit path including timeout and panic unwinding.
#[derive(Clone)]
pub struct Throttler {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl Throttler {
    pub fn new(max_concurrent_tasks: usize) -> Self {
        let capacity = max_concurrent_tasks.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Suspends the calling task (not the process) until a slot frees up.
    pub async fn acquire(&self) -> Slot {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("throttler semaphore closed");
        Slot { _permit: permit }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
