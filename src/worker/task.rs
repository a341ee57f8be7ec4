//! Node-wide indexing slot.
//!
//! At most one schema batch rebuilds indexes at a time. The batch holds a
//! [`TaskHandle`] for as long as any of its rebuilds runs; the slot is released
//! exactly once, either explicitly through [`TaskHandle::finish`] or when the last
//! reference to the handle is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::types::Ts;

#[derive(Copy, Clone, Debug)]
struct Claim {
    generation: u64,
    start_ts: Ts,
}

/// Exclusive right to run index rebuilds on this node.
#[derive(Default)]
pub struct IndexingSlot {
    claim: Mutex<Option<Claim>>,
    idle: Notify,
    generation: AtomicU64,
}

impl IndexingSlot {
    /// Creates a free slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while a batch holds the slot.
    pub fn is_running(&self) -> bool {
        self.claim.lock().is_some()
    }

    /// Start timestamp of the batch holding the slot.
    pub fn running_ts(&self) -> Option<Ts> {
        self.claim.lock().map(|claim| claim.start_ts)
    }

    /// Waits until no batch holds the slot.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }

    /// Claims the slot for the batch at `start_ts`, waiting for the current
    /// holder to release it.
    pub async fn acquire(self: &Arc<Self>, start_ts: Ts) -> TaskHandle {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut claim = self.claim.lock();
                if claim.is_none() {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    *claim = Some(Claim {
                        generation,
                        start_ts,
                    });
                    debug!(generation, start_ts, "worker.indexing.claimed");
                    return TaskHandle {
                        slot: self.clone(),
                        generation,
                        started: Instant::now(),
                        done: AtomicBool::new(false),
                    };
                }
            }
            notified.await;
        }
    }

    fn release(&self, generation: u64) {
        {
            let mut claim = self.claim.lock();
            if claim.is_some_and(|c| c.generation == generation) {
                *claim = None;
            }
        }
        debug!(generation, "worker.indexing.released");
        self.idle.notify_waiters();
    }
}

/// Claim on the [`IndexingSlot`].
pub struct TaskHandle {
    slot: Arc<IndexingSlot>,
    generation: u64,
    started: Instant,
    done: AtomicBool,
}

impl TaskHandle {
    /// Generation number of this claim.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Time since the slot was claimed.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Releases the slot. Returns `true` only for the call that released it.
    pub fn finish(&self) -> bool {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.slot.release(self.generation);
        true
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.finish();
    }
}
