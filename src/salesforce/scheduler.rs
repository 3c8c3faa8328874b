//! Concurrency control for polling partition jobs.
//!
//! A chunked export monitors many partition jobs at once. The scheduler
//! bounds how many are polled concurrently so a large partition count does
//! not translate into a burst of status requests every round.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of partition jobs polled concurrently.
pub const DEFAULT_MAX_CONCURRENT_POLLS: usize = 4;

// ─────────────────────────────────────────────────────────────────────────────
// PollScheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Semaphore-backed permit pool. Permits release automatically on drop, so
/// a slot can never leak on an early return.
#[derive(Clone)]
pub struct PollScheduler {
    sem: Arc<Semaphore>,
    max: usize,
}

impl PollScheduler {
    /// # Panics
    ///
    /// Panics if `max_concurrent` is 0.
    pub fn new(max_concurrent: usize) -> Self {
        assert!(max_concurrent > 0, "max_concurrent must be greater than 0");

        Self {
            sem: Arc::new(Semaphore::new(max_concurrent)),
            max: max_concurrent,
        }
    }

    /// Acquires a permit, waiting if all slots are currently in use.
    pub async fn acquire(&self) -> PollPermit {
        // The semaphore is never closed, so acquire_owned cannot fail
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed unexpectedly");

        PollPermit { _permit: permit }
    }

    /// Number of partition jobs currently holding a slot.
    pub fn active(&self) -> usize {
        self.max - self.sem.available_permits()
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

impl Default for PollScheduler {
    fn default() -> Self {
        PollScheduler::new(DEFAULT_MAX_CONCURRENT_POLLS)
    }
}

/// An active polling slot; dropping it frees the slot.
pub struct PollPermit {
    _permit: OwnedSemaphorePermit,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
