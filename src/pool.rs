//! # Instance pools for the hot-path components.
//!
//! One pool per kind. Instances carry a monotonically-increasing `id`
//! (assigned once, preserved across reuse) and an `acquires` count that
//! increments on every take - the fingerprint for diagnosing reuse bugs.
//!
//! ## Rules
//! - `on_release` must clear every reference slot; a later user must never
//!   inherit stale callbacks, contexts or tasks.
//! - `on_release` may refuse recycling (returns `false`) - e.g. a shared
//!   handle that still has outstanding clones is dropped, not pooled.
//! - The single release path per acquisition is enforced by ownership:
//!   the releasing method consumes the instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A pooled kind: how to build, refresh and scrub an instance.
pub(crate) trait Recycle: Sized + Send {
    /// Builds a fresh instance with the pool-assigned id.
    fn build(id: u64) -> Self;

    /// Refreshes per-acquisition state (acquire count, defaults, clocks).
    fn on_acquire(&mut self);

    /// Scrubs reference slots; returns `false` to drop instead of pooling.
    fn on_release(&mut self) -> bool;
}

/// Free-list pool with a monotonic id sequence.
pub(crate) struct Pool<T> {
    idle: Mutex<Vec<T>>,
    seq: AtomicU64,
}

impl<T: Recycle> Pool<T> {
    pub(crate) const fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Takes an idle instance, or builds one with the next id.
    pub(crate) fn acquire(&self) -> T {
        let recycled = lock(&self.idle).pop();
        let mut item = match recycled {
            Some(item) => item,
            None => T::build(self.seq.fetch_add(1, Ordering::Relaxed) + 1),
        };
        item.on_acquire();
        item
    }

    /// Scrubs and returns an instance to the free list.
    pub(crate) fn release(&self, mut item: T) {
        if item.on_release() {
            lock(&self.idle).push(item);
        }
    }
}

/// Locks without propagating poison: pooled state is scrubbed on release,
/// so a panicked holder cannot leave an observable half-state behind.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
