//! Global admission queue for whole-file transfers.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// FIFO admission queue bounding concurrent transfers
///
/// Waiters are served in arrival order. A slot is held by its
/// [`AdmissionPermit`] and returned when the permit is dropped.
#[derive(Debug, Clone)]
pub struct AdmissionQueue {
    slots: Arc<Semaphore>,
    capacity: usize,
}

/// A held admission slot
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionQueue {
    /// Create a queue with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Configured slot count
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held
    pub fn active(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Wait for a slot
    ///
    /// Returns `None` only if the queue was closed.
    pub async fn acquire(&self) -> Option<AdmissionPermit> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .ok()
            .map(|permit| AdmissionPermit { _permit: permit })
    }

    /// Take a slot without waiting
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        Arc::clone(&self.slots)
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionPermit { _permit: permit })
    }

    /// Stop admitting; pending waiters resolve to `None`
    pub fn close(&self) {
        self.slots.close();
    }
}
