//! # One-shot bounded-parallelism fan-out over a fixed task set.
//!
//! A [`Batch`] collects tasks into an unordered table, then `run` spawns at
//! most `min(parallel, task_count)` workers that drain the table and blocks
//! until every task has completed. Execution order is undefined on purpose.
//!
//! `run` consumes the batch: one run per acquisition, and the instance goes
//! back to its pool before the counters are returned (the counters are
//! snapshotted first).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinSet;

use crate::pool::{Pool, Recycle};
use crate::task::{take_any, Task};

static POOL: Pool<Batch> = Pool::new();

const DEFAULT_PARALLEL: usize = 10;

/// Bounded fan-out executor for a fixed set of tasks.
pub struct Batch {
    inner: Arc<BatchInner>,
}

struct BatchInner {
    id: u64,
    acquires: AtomicU64,

    parallel: AtomicUsize,
    task_index: AtomicU64,
    tasks: DashMap<u64, Task>,

    total: AtomicU64,
    success: AtomicU64,
}

impl Batch {
    /// Takes a scrubbed instance from the pool.
    pub fn acquire() -> Batch {
        POOL.acquire()
    }

    /// Appends a task; safe to call from multiple threads before `run`.
    pub fn add(&self, task: Task) -> &Self {
        let index = self.inner.task_index.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.tasks.insert(index, task);
        self
    }

    /// Adjusts the in-flight bound (default 10).
    pub fn set_parallel(&self, parallel: usize) -> &Self {
        self.inner.parallel.store(parallel.max(1), Ordering::Release);
        self
    }

    /// Returns `(id, acquires)` - the instance's pool fingerprint.
    pub fn identify(&self) -> (u64, u64) {
        (self.inner.id, self.inner.acquires.load(Ordering::Relaxed))
    }

    /// Runs every added task, blocking until all have completed.
    ///
    /// Returns `(total, success)`: `total` equals the number of added tasks,
    /// `success` counts the tasks whose handler completed without failure.
    pub async fn run(self) -> (u64, u64) {
        let pending = self.inner.tasks.len();
        let workers = pending.min(self.inner.parallel.load(Ordering::Acquire));

        let mut set = JoinSet::new();
        for _ in 0..workers {
            let inner = self.inner.clone();
            set.spawn(async move { inner.work().await });
        }
        while set.join_next().await.is_some() {}

        let totals = (
            self.inner.total.load(Ordering::Acquire),
            self.inner.success.load(Ordering::Acquire),
        );
        POOL.release(self);
        totals
    }
}

impl BatchInner {
    /// Worker loop: drain arbitrary table entries until none remain.
    async fn work(&self) {
        while let Some(task) = take_any(&self.tasks) {
            self.total.fetch_add(1, Ordering::AcqRel);
            if task.run().await {
                self.success.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}

impl Recycle for Batch {
    fn build(id: u64) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                id,
                acquires: AtomicU64::new(0),
                parallel: AtomicUsize::new(DEFAULT_PARALLEL),
                task_index: AtomicU64::new(0),
                tasks: DashMap::new(),
                total: AtomicU64::new(0),
                success: AtomicU64::new(0),
            }),
        }
    }

    fn on_acquire(&mut self) {
        self.inner.acquires.fetch_add(1, Ordering::Relaxed);
        self.inner.parallel.store(DEFAULT_PARALLEL, Ordering::Release);
        self.inner.task_index.store(0, Ordering::Release);
        self.inner.total.store(0, Ordering::Release);
        self.inner.success.store(0, Ordering::Release);
    }

    fn on_release(&mut self) -> bool {
        // A worker clone still alive means the inner state is shared;
        // dropping instead of pooling prevents aliased reuse.
        if Arc::strong_count(&self.inner) != 1 {
            return false;
        }
        self.inner.tasks.clear();
        true
    }
}
