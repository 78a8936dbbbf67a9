//! # Pooled one-shot unit of work.
//!
//! A [`Task`] pairs a [`Handler`] (produces a payload, fails by panicking)
//! with an optional finish callback that receives the
//! [`TaskResult`](crate::TaskResult). Both run under the panic shield:
//! a handler panic is recorded in the result, a finish panic is logged and
//! swallowed. `run` consumes the task and releases it to the pool.
//!
//! Handlers can be any [`Handler`] implementor shared as an `Arc`, or a
//! closure via [`Task::handler_fn`] (backed by [`HandlerFn`]).

use std::any::Any;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::Fault;
use crate::pool::{Pool, Recycle};
use crate::shield::guarded;
use crate::task_result::TaskResult;

static POOL: Pool<Task> = Pool::new();

/// Universal container for a handler's return value.
pub type Payload = Box<dyn Any + Send>;

/// Boxes any sendable value as a [`Payload`].
pub fn payload<T: Send + 'static>(value: T) -> Payload {
    Box::new(value)
}

type Finish =
    Box<dyn FnOnce(CancellationToken, TaskResult) -> BoxFuture<'static, ()> + Send + Sync>;

/// # Asynchronous unit of work with an opaque return value.
///
/// Implementors signal failure by panicking; the shield converts the panic
/// into a fault on the task's result.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Produces the task's payload, or `None` when there is nothing to
    /// return.
    async fn handle(&self, ctx: CancellationToken) -> Option<Payload>;
}

/// # Function-backed [`Handler`] implementation.
///
/// Wraps a closure `F: FnMut(CancellationToken) -> Fut`. The closure is
/// guarded by a [`Mutex`] held only while the future is created, never while
/// it runs.
pub struct HandlerFn<F, Fut>
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Option<Payload>> + Send + 'static,
{
    func: Mutex<F>,
}

impl<F, Fut> HandlerFn<F, Fut>
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Option<Payload>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func: Mutex::new(func),
        }
    }

    /// Creates the handler and returns it as a shared trait object.
    pub fn arc(func: F) -> std::sync::Arc<dyn Handler> {
        std::sync::Arc::new(Self::new(func))
    }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F, Fut>
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Option<Payload>> + Send + 'static,
{
    async fn handle(&self, ctx: CancellationToken) -> Option<Payload> {
        let fut = {
            let mut f = self.func.lock().unwrap_or_else(PoisonError::into_inner);
            (f)(ctx)
        };
        fut.await
    }
}

/// A pooled one-shot task: handler plus finish callback.
///
/// Lifecycle: acquired → configured → [`run`](Task::run) exactly once →
/// released. The consuming `run` makes a second run or a double release
/// unrepresentable.
pub struct Task {
    id: u64,
    acquires: u64,
    created: Instant,

    ctx: Option<CancellationToken>,
    handler: Option<std::sync::Arc<dyn Handler>>,
    finish: Option<Finish>,
}

impl Task {
    /// Takes a scrubbed instance from the pool.
    pub fn acquire() -> Task {
        POOL.acquire()
    }

    /// Sets the context handed to the handler and finish callbacks.
    pub fn context(mut self, ctx: CancellationToken) -> Self {
        self.ctx = Some(ctx);
        self
    }

    /// Sets the handler.
    pub fn handler(mut self, handler: std::sync::Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Sets a closure handler; shorthand for [`HandlerFn::arc`].
    pub fn handler_fn<F, Fut>(self, f: F) -> Self
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Option<Payload>> + Send + 'static,
    {
        self.handler(HandlerFn::arc(f))
    }

    /// Sets the finish callback; it receives the task's result.
    pub fn finish<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(CancellationToken, TaskResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.finish = Some(Box::new(move |ctx, res| f(ctx, res).boxed()));
        self
    }

    /// Returns `(id, acquires)` - the instance's pool fingerprint.
    pub fn identify(&self) -> (u64, u64) {
        (self.id, self.acquires)
    }

    /// Runs the handler, delivers the result, releases the task.
    ///
    /// Returns whether the handler completed without failure. A task with no
    /// handler records [`Fault::HandlerMissing`] and still delivers `finish`.
    pub async fn run(mut self) -> bool {
        let ctx = self.ctx.take().unwrap_or_default();
        let mut res = TaskResult::new(self.created);
        res.begin = Instant::now();

        let mut success = false;
        match self.handler.take() {
            None => {
                res.finish = Instant::now();
                res.errors.push(Fault::HandlerMissing);
            }
            Some(handler) => {
                let run = {
                    let ctx = ctx.clone();
                    guarded(async move { handler.handle(ctx).await })
                };
                match run.await {
                    Ok(returned) => {
                        res.finish = Instant::now();
                        res.returned = returned;
                        success = true;
                    }
                    Err(fault) => {
                        res.finish = Instant::now();
                        res.returned = None;
                        res.errors.push(fault);
                    }
                }
            }
        }
        res.close();

        if let Some(finish) = self.finish.take() {
            let delivery = guarded(async move { finish(ctx, res).await });
            if let Err(fault) = delivery.await {
                tracing::error!(fault = %fault, "task finish callback panicked");
            }
        }

        POOL.release(self);
        success
    }
}

impl Recycle for Task {
    fn build(id: u64) -> Self {
        Self {
            id,
            acquires: 0,
            created: Instant::now(),
            ctx: None,
            handler: None,
            finish: None,
        }
    }

    fn on_acquire(&mut self) {
        self.acquires += 1;
        self.created = Instant::now();
    }

    fn on_release(&mut self) -> bool {
        self.ctx = None;
        self.handler = None;
        self.finish = None;
        true
    }
}

/// Removes an arbitrary entry from a task table.
///
/// Selection is unordered on purpose; workers draining a table make no
/// submission-order promise.
pub(crate) fn take_any(table: &DashMap<u64, Task>) -> Option<Task> {
    loop {
        let key = *table.iter().next()?.key();
        if let Some((_, task)) = table.remove(&key) {
            return Some(task);
        }
    }
}
