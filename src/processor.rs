//! # Restartable supervised unit with composable children.
//!
//! A [`Processor`] models an in-process worker: a `before` guard phase, a
//! restartable main loop, an `after` phase, and a tree of named children
//! that start with each iteration and stop with its cancellation.
//!
//! ## Lifecycle
//! ```text
//!  start(ctx)
//!    │ before guards ── true/panic ──► after, stopped
//!    ▼
//!  ┌─ iteration ───────────────────────────────┐
//!  │ derive iteration token                    │
//!  │ spawn stopped children (iteration token)  │
//!  │ run main callbacks (sequential, shielded) │
//!  │ cancel iteration token                    │
//!  │ poll children until all stopped           │
//!  └──────────── restart latch set? ── yes ────┘
//!    │ no
//!    ▼ after guards, stopped, optional unbind
//! ```
//!
//! Two cancellation levels: the caller's token ends the processor outright;
//! the per-iteration child token is what [`stop`](Processor::stop) and
//! [`restart`](Processor::restart) cancel. Children receive the iteration
//! token as their parent, so an iteration's end cascades to them.
//!
//! Children are not owned: `del` removes a child without stopping it, `add`
//! does not start one (it starts on the next iteration). A child with
//! `unbind_when_stopped` removes itself from its parent when it fully stops.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::callback::{Guard, PanicHook, ProcessBody};
use crate::error::{Fault, RuntimeError};
use crate::shield::guarded;

/// Poll interval while waiting for children to stop.
const CHILD_POLL_TICK: Duration = Duration::from_millis(10);

/// A named, restartable supervised unit.
///
/// Cheap to clone; clones share the same underlying processor.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    name: String,

    parent: RwLock<Weak<ProcessorInner>>,
    children: DashMap<String, Processor>,

    before: RwLock<Vec<Guard>>,
    main: RwLock<Vec<ProcessBody>>,
    after: RwLock<Vec<Guard>>,
    hook: RwLock<Option<PanicHook>>,

    unbind: AtomicBool,
    state: Mutex<LifecycleState>,
}

#[derive(Default)]
struct LifecycleState {
    running: bool,
    restart: bool,
    /// Token scoped to the current iteration; `Some` iff an iteration is
    /// live.
    ctx: Option<CancellationToken>,
}

impl Processor {
    /// Creates a stopped processor with the given name.
    pub fn new(name: impl Into<String>) -> Processor {
        Processor {
            inner: Arc::new(ProcessorInner {
                name: name.into(),
                parent: RwLock::new(Weak::new()),
                children: DashMap::new(),
                before: RwLock::new(Vec::new()),
                main: RwLock::new(Vec::new()),
                after: RwLock::new(Vec::new()),
                hook: RwLock::new(None),
                unbind: AtomicBool::new(false),
                state: Mutex::new(LifecycleState::default()),
            }),
        }
    }

    /// The processor's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Attaches a child by name; a name already present is ignored.
    ///
    /// Attaching sets the child's parent back-reference. The child is not
    /// started; stopped children start on the next iteration.
    pub fn add(&self, child: &Processor) -> &Self {
        let name = child.inner.name.clone();
        let mut inserted = false;
        self.inner.children.entry(name).or_insert_with(|| {
            inserted = true;
            child.clone()
        });
        if inserted {
            *write(&child.inner.parent) = Arc::downgrade(&self.inner);
        }
        self
    }

    /// Detaches a child by name without stopping it.
    pub fn del(&self, name: &str) -> &Self {
        if let Some((_, child)) = self.inner.children.remove(name) {
            *write(&child.inner.parent) = Weak::new();
        }
        self
    }

    /// Looks up a child by name.
    pub fn get(&self, name: &str) -> Option<Processor> {
        self.inner.children.get(name).map(|c| c.value().clone())
    }

    /// The parent, if this processor is currently attached to one.
    pub fn parent(&self) -> Option<Processor> {
        read(&self.inner.parent)
            .upgrade()
            .map(|inner| Processor { inner })
    }

    /// Appends a `before` guard.
    pub fn before<F, Fut>(&self, f: F) -> &Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        write(&self.inner.before).push(Arc::new(move |ctx| f(ctx).boxed()));
        self
    }

    /// Appends a main callback; it receives the iteration token.
    pub fn callback<F, Fut>(&self, f: F) -> &Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        write(&self.inner.main).push(Arc::new(move |ctx| f(ctx).boxed()));
        self
    }

    /// Appends an `after` guard.
    pub fn after<F, Fut>(&self, f: F) -> &Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        write(&self.inner.after).push(Arc::new(move |ctx| f(ctx).boxed()));
        self
    }

    /// Sets the panic observer; fired for every panic captured anywhere in
    /// the processor's lifetime.
    pub fn on_panic<F>(&self, f: F) -> &Self
    where
        F: Fn(CancellationToken, &Fault) + Send + Sync + 'static,
    {
        *write(&self.inner.hook) = Some(Arc::new(f));
        self
    }

    /// When set, the processor removes itself from its parent on full stop.
    pub fn unbind_when_stopped(&self, unbind: bool) -> &Self {
        self.inner.unbind.store(unbind, Ordering::Release);
        self
    }

    /// Whether an iteration is live and its token uncancelled.
    pub fn healthy(&self) -> bool {
        let state = self.inner.lock_state();
        state.ctx.as_ref().is_some_and(|c| !c.is_cancelled())
    }

    /// Whether the processor never started or has fully drained.
    pub fn stopped(&self) -> bool {
        !self.inner.lock_state().running
    }

    /// Ends the current iteration without scheduling another.
    ///
    /// Effective only while healthy; the processor then drains its children
    /// and runs its `after` phase.
    pub fn stop(&self) {
        let token = {
            let mut state = self.inner.lock_state();
            match state.ctx.as_ref().filter(|c| !c.is_cancelled()).cloned() {
                Some(token) => {
                    state.restart = false;
                    Some(token)
                }
                None => None,
            }
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Ends the current iteration and schedules exactly one more.
    pub fn restart(&self) {
        let token = {
            let mut state = self.inner.lock_state();
            match state.ctx.as_ref().filter(|c| !c.is_cancelled()).cloned() {
                Some(token) => {
                    state.restart = true;
                    Some(token)
                }
                None => None,
            }
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Runs the full lifecycle; blocks until the processor stops.
    ///
    /// Returns the first surfaced failure: a `before` failure, or an `after`
    /// failure when nothing failed earlier. Main-callback panics are
    /// observed but never fail the processor.
    pub async fn start(&self, parent: CancellationToken) -> Result<(), RuntimeError> {
        {
            let mut state = self.inner.lock_state();
            if state.running {
                return Err(RuntimeError::RunningAlready {
                    name: self.inner.name.clone(),
                });
            }
            state.running = true;
            // Prime the latch so a fresh start enters the loop.
            state.restart = true;
        }

        let mut result: Result<(), RuntimeError> = Ok(());

        // Before phase: a true or a panic skips the loop entirely.
        let mut skipped = false;
        for guard in snapshot(&self.inner.before) {
            match guarded(async { guard(parent.clone()).await }).await {
                Ok(false) => {}
                Ok(true) => {
                    skipped = true;
                    break;
                }
                Err(fault) => {
                    self.observe(&parent, &fault);
                    result = Err(fault.into());
                    skipped = true;
                    break;
                }
            }
        }

        if !skipped {
            loop {
                if parent.is_cancelled() {
                    break;
                }
                {
                    let mut state = self.inner.lock_state();
                    if !state.restart {
                        break;
                    }
                    state.restart = false;
                }

                let iteration = parent.child_token();
                self.inner.lock_state().ctx = Some(iteration.clone());

                self.spawn_stopped_children(&iteration);

                for body in snapshot(&self.inner.main) {
                    match guarded(async { body(iteration.clone()).await }).await {
                        Ok(false) => {}
                        Ok(true) => break,
                        Err(fault) => {
                            self.observe(&iteration, &fault);
                            break;
                        }
                    }
                }

                iteration.cancel();
                self.wait_children().await;
                self.inner.lock_state().ctx = None;
            }
        }

        // After phase always runs; its failure surfaces only when nothing
        // failed earlier.
        for guard in snapshot(&self.inner.after) {
            match guarded(async { guard(parent.clone()).await }).await {
                Ok(false) => {}
                Ok(true) => break,
                Err(fault) => {
                    self.observe(&parent, &fault);
                    if result.is_ok() {
                        result = Err(fault.into());
                    }
                    break;
                }
            }
        }

        {
            let mut state = self.inner.lock_state();
            state.running = false;
            state.restart = false;
            state.ctx = None;
        }
        if self.inner.unbind.load(Ordering::Acquire) {
            if let Some(parent_proc) = self.parent() {
                parent_proc.del(&self.inner.name);
            }
        }
        result
    }

    /// Spawns every currently-stopped child under the iteration token.
    fn spawn_stopped_children(&self, iteration: &CancellationToken) {
        let children: Vec<Processor> = self
            .inner
            .children
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for child in children {
            if child.stopped() {
                let token = iteration.clone();
                tokio::spawn(async move {
                    let _ = child.start(token).await;
                });
            }
        }
    }

    /// Polls until every child reports stopped.
    ///
    /// The iteration token is already cancelled here; a still-healthy child
    /// is merely one that has not observed the cancellation yet.
    async fn wait_children(&self) {
        loop {
            let all_stopped = self
                .inner
                .children
                .iter()
                .all(|entry| entry.value().stopped());
            if all_stopped {
                return;
            }
            tokio::time::sleep(CHILD_POLL_TICK).await;
        }
    }

    fn observe(&self, ctx: &CancellationToken, fault: &Fault) {
        let hook = read(&self.inner.hook).clone();
        if let Some(hook) = hook {
            hook(ctx.clone(), fault);
        }
    }
}

impl ProcessorInner {
    fn lock_state(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clones the registered callbacks so none of the locks is held across an
/// await.
fn snapshot<T: Clone>(slot: &RwLock<Vec<T>>) -> Vec<T> {
    read(slot).clone()
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
