//! # Long-lived accepting queue with dynamic parallelism.
//!
//! A [`Service`] accepts tasks while running and executes them on a set of
//! self-regulating workers. Parallelism can be raised or lowered at any
//! time; lowering makes surplus workers retire on their next acquisition.
//!
//! ## Architecture
//! ```text
//!  add(task) ──► [channel] ──► accept loop ──► task table
//!                                │                 │
//!                          token.cancelled     workers ≤ parallel
//!                                │                 │
//!                                ▼                 ▼
//!                          graceful drain ◄── counters
//! ```
//!
//! ## Rules
//! - `start` blocks until the service is cancelled **and** every accepted
//!   task has completed; accepted tasks are never dropped.
//! - `add` fails once the service is stopped or stopping; during brief
//!   transitions it sleeps one tick and retries.
//! - Task execution order is unrelated to submission order.
//! - The instance stays acquired after `start` returns;
//!   [`Service::release`] is the explicit return-to-pool.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;
use crate::pool::{Pool, Recycle};
use crate::task::{take_any, Task};

static POOL: Pool<Service> = Pool::new();

const DEFAULT_PARALLEL: usize = 10;
/// Drain poll interval while waiting for in-flight tasks.
const DRAIN_TICK: Duration = Duration::from_millis(100);
/// Retry interval for `add` during lifecycle transitions.
const RETRY_TICK: Duration = Duration::from_millis(1);

/// Long-running task acceptor with bounded, adjustable concurrency.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    id: u64,
    acquires: AtomicU64,

    parallel: AtomicUsize,
    concurrency: AtomicUsize,
    /// Tasks taken off the channel but not yet in the table.
    pending: AtomicUsize,

    task_index: AtomicU64,
    tasks: DashMap<u64, Task>,
    total: AtomicU64,
    success: AtomicU64,

    state: Mutex<ServiceState>,
}

#[derive(Default)]
struct ServiceState {
    started: bool,
    ctx: Option<CancellationToken>,
    tx: Option<mpsc::Sender<Task>>,
}

impl Service {
    /// Takes a scrubbed instance from the pool.
    pub fn acquire() -> Service {
        POOL.acquire()
    }

    /// Submits a task to the running service.
    ///
    /// Blocks only while the accept loop is busy; returns
    /// [`RuntimeError::NotAccepting`] when the service is idle or stopping.
    pub async fn add(&self, task: Task) -> Result<(), RuntimeError> {
        loop {
            let tx = {
                let state = self.inner.lock_state();
                let healthy = state.started
                    && state.ctx.as_ref().is_some_and(|c| !c.is_cancelled());
                if !healthy {
                    return Err(RuntimeError::NotAccepting);
                }
                state.tx.clone()
            };

            match tx {
                // Transitional: started but the channel is not wired yet.
                None => {
                    tokio::time::sleep(RETRY_TICK).await;
                    continue;
                }
                Some(tx) => {
                    return match tx.send(task).await {
                        Ok(()) => Ok(()),
                        Err(_) => Err(RuntimeError::NotAccepting),
                    };
                }
            }
        }
    }

    /// Sets the parallelism target.
    ///
    /// Raising it while running spawns the difference immediately; lowering
    /// it lets surplus workers retire on their next task acquisition.
    pub fn set_parallel(&self, parallel: usize) -> &Self {
        let parallel = parallel.max(1);
        let old = self.inner.parallel.swap(parallel, Ordering::AcqRel);
        if old == parallel {
            return self;
        }
        tracing::info!(id = self.inner.id, from = old, to = parallel, "service parallelism changed");

        if parallel > old {
            let healthy = {
                let state = self.inner.lock_state();
                state.ctx.as_ref().is_some_and(|c| !c.is_cancelled())
            };
            if healthy {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    for _ in 0..(parallel - old) {
                        let inner = self.inner.clone();
                        handle.spawn(async move { inner.pop().await });
                    }
                }
            }
        }
        self
    }

    /// Returns `(id, acquires)` - the instance's pool fingerprint.
    pub fn identify(&self) -> (u64, u64) {
        (self.inner.id, self.inner.acquires.load(Ordering::Relaxed))
    }

    /// Returns `(total, success)` for the current acquisition.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.inner.total.load(Ordering::Acquire),
            self.inner.success.load(Ordering::Acquire),
        )
    }

    /// Runs the accept loop until `parent` is cancelled, then drains.
    ///
    /// Does not return until every accepted task has completed. Returns
    /// [`RuntimeError::StartedAlready`] when called on a running instance.
    pub async fn start(&self, parent: CancellationToken) -> Result<(), RuntimeError> {
        let (token, mut rx) = {
            let mut state = self.inner.lock_state();
            if state.started {
                return Err(RuntimeError::StartedAlready);
            }
            let token = parent.child_token();
            let (tx, rx) = mpsc::channel(1);
            state.started = true;
            state.ctx = Some(token.clone());
            state.tx = Some(tx);
            (token, rx)
        };
        tracing::info!(id = self.inner.id, "service started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = rx.recv() => match received {
                    Some(task) => self.inner.clone().accept(task),
                    None => break,
                },
            }
        }

        // Force-cancel so late adders observe the stop, then unwire the
        // channel and rescue whatever was buffered at cancellation time.
        token.cancel();
        {
            let mut state = self.inner.lock_state();
            state.tx = None;
        }
        while let Ok(task) = rx.try_recv() {
            self.inner.clone().accept(task);
        }
        drop(rx);

        self.inner.drain().await;
        let (total, success) = self.counters();
        tracing::info!(id = self.inner.id, total, success, "service stopped");

        {
            let mut state = self.inner.lock_state();
            state.started = false;
            state.ctx = None;
        }
        Ok(())
    }

    /// Returns the instance to its pool.
    ///
    /// The service must be stopped and this must be the last handle;
    /// otherwise the instance is dropped instead of recycled.
    pub fn release(self) {
        POOL.release(self);
    }
}

impl ServiceInner {
    fn lock_state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands a task received from the channel to the worker side.
    fn accept(self: Arc<Self>, task: Task) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            let index = self.task_index.fetch_add(1, Ordering::Relaxed) + 1;
            self.tasks.insert(index, task);
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.pop().await;
        });
    }

    /// Worker discipline: claim a concurrency slot, drain the table,
    /// retire when over the parallelism target or out of work.
    async fn pop(&self) {
        loop {
            let claimed = self.concurrency.fetch_add(1, Ordering::AcqRel) + 1;
            if claimed > self.parallel.load(Ordering::Acquire) {
                self.concurrency.fetch_sub(1, Ordering::AcqRel);
                return;
            }

            while let Some(task) = take_any(&self.tasks) {
                self.total.fetch_add(1, Ordering::AcqRel);
                if task.run().await {
                    self.success.fetch_add(1, Ordering::AcqRel);
                }
                // Scale-down: retire before the next acquisition.
                if self.concurrency.load(Ordering::Acquire) > self.parallel.load(Ordering::Acquire)
                {
                    break;
                }
            }

            self.concurrency.fetch_sub(1, Ordering::AcqRel);
            if self.tasks.is_empty() {
                return;
            }
            // The table refilled while this worker was retiring; loop and
            // try to claim a slot again.
        }
    }

    /// Blocks until no task is pending, tabled, or running.
    async fn drain(&self) {
        loop {
            let idle = self.pending.load(Ordering::Acquire) == 0
                && self.tasks.is_empty()
                && self.concurrency.load(Ordering::Acquire) == 0;
            if idle {
                return;
            }
            tracing::debug!(id = self.id, "service waiting for tasks to finish");
            tokio::time::sleep(DRAIN_TICK).await;
        }
    }
}

impl Recycle for Service {
    fn build(id: u64) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                id,
                acquires: AtomicU64::new(0),
                parallel: AtomicUsize::new(DEFAULT_PARALLEL),
                concurrency: AtomicUsize::new(0),
                pending: AtomicUsize::new(0),
                task_index: AtomicU64::new(0),
                tasks: DashMap::new(),
                total: AtomicU64::new(0),
                success: AtomicU64::new(0),
                state: Mutex::new(ServiceState::default()),
            }),
        }
    }

    fn on_acquire(&mut self) {
        self.inner.acquires.fetch_add(1, Ordering::Relaxed);
        self.inner.parallel.store(DEFAULT_PARALLEL, Ordering::Release);
        self.inner.concurrency.store(0, Ordering::Release);
        self.inner.pending.store(0, Ordering::Release);
        self.inner.task_index.store(0, Ordering::Release);
        self.inner.total.store(0, Ordering::Release);
        self.inner.success.store(0, Ordering::Release);
        let mut state = self.inner.lock_state();
        state.started = false;
        state.ctx = None;
        state.tx = None;
    }

    fn on_release(&mut self) -> bool {
        if Arc::strong_count(&self.inner) != 1 {
            return false;
        }
        {
            let state = self.inner.lock_state();
            if state.started {
                tracing::error!(id = self.inner.id, "service released while running; dropping");
                return false;
            }
        }
        self.inner.tasks.clear();
        let mut state = self.inner.lock_state();
        state.ctx = None;
        state.tx = None;
        true
    }
}
