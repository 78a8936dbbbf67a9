//! # Structured failure-isolation block.
//!
//! [`Catchable`] imposes a deterministic guard → body → catch → finally
//! order over an arbitrary set of callbacks, with panic containment at every
//! boundary. Instances are recycled through a pool; `run` consumes the block
//! and returns it automatically.
//!
//! ## Phase rules
//! ```text
//!   before (guards)  ──true/panic──► skip everything below
//!        │
//!   body callbacks   ──panic──► failure recorded, body loop stops
//!        │
//!   catch handlers      (only when the body produced a failure)
//!        │
//!   finalizers          (whenever no guard short-circuited)
//! ```
//! - Within a phase: strict registration order; `true` stops the loop.
//! - A guard panic becomes the run's failure and skips bodies, catches and
//!   finalizers.
//! - Catch/finally panics are observed but never propagate.
//! - The panic observer fires once for every captured panic, in any phase.
//!
//! ## Example
//! ```no_run
//! use taskwarden::Catchable;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() {
//! let outcome = Catchable::acquire()
//!     .body(|_ctx| async move { panic!("boom") })
//!     .catch(|_ctx, fault| async move {
//!         println!("captured: {fault}");
//!         false
//!     })
//!     .finally(|_ctx| async move { false })
//!     .run(CancellationToken::new())
//!     .await;
//!
//! assert!(outcome.is_err());
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::callback::{Body, CatchHook, Finalizer, Guard, PanicHook};
use crate::error::Fault;
use crate::pool::{Pool, Recycle};
use crate::shield::guarded;

static POOL: Pool<Catchable> = Pool::new();

/// A one-shot structured block with guard/body/catch/finally phases under a
/// panic shield.
pub struct Catchable {
    id: u64,
    acquires: u64,

    guards: Vec<Guard>,
    bodies: Vec<Body>,
    catches: Vec<CatchHook>,
    finalizers: Vec<Finalizer>,
    hook: Option<PanicHook>,
}

impl Catchable {
    /// Takes a scrubbed instance from the pool.
    pub fn acquire() -> Catchable {
        POOL.acquire()
    }

    /// Registers a guard; appended to the guard vector.
    pub fn before<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.guards.push(Arc::new(move |ctx| f(ctx).boxed()));
        self
    }

    /// Registers a body callback.
    pub fn body<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.bodies.push(Arc::new(move |ctx| f(ctx).boxed()));
        self
    }

    /// Registers a catch handler; invoked with the captured failure.
    pub fn catch<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken, Fault) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.catches
            .push(Arc::new(move |ctx, fault| f(ctx, fault).boxed()));
        self
    }

    /// Registers a finalizer.
    pub fn finally<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.finalizers.push(Arc::new(move |ctx| f(ctx).boxed()));
        self
    }

    /// Sets the panic observer.
    pub fn on_panic<F>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken, &Fault) + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(f));
        self
    }

    /// Returns `(id, acquires)` - the instance's pool fingerprint.
    pub fn identify(&self) -> (u64, u64) {
        (self.id, self.acquires)
    }

    /// Executes the block once and releases the instance back to its pool.
    ///
    /// Returns the failure captured in the guard or body phase, if any.
    pub async fn run(self, ctx: CancellationToken) -> Result<(), Fault> {
        let outcome = self.execute(&ctx).await;
        POOL.release(self);
        outcome
    }

    async fn execute(&self, ctx: &CancellationToken) -> Result<(), Fault> {
        // Guard phase: true or panic skips everything below.
        for guard in &self.guards {
            match guarded(async { guard(ctx.clone()).await }).await {
                Ok(false) => {}
                Ok(true) => return Ok(()),
                Err(fault) => {
                    self.observe(ctx, &fault);
                    return Err(fault);
                }
            }
        }

        // Body phase: a panic is recorded as the run's failure.
        let mut failure: Option<Fault> = None;
        for body in &self.bodies {
            match guarded(async { body(ctx.clone()).await }).await {
                Ok(false) => {}
                Ok(true) => break,
                Err(fault) => {
                    self.observe(ctx, &fault);
                    failure = Some(fault);
                    break;
                }
            }
        }

        // Catch phase: only when the body produced a failure.
        if let Some(fault) = &failure {
            for handler in &self.catches {
                match guarded(async { handler(ctx.clone(), fault.clone()).await }).await {
                    Ok(false) => {}
                    Ok(true) => break,
                    Err(inner) => {
                        self.observe(ctx, &inner);
                        break;
                    }
                }
            }
        }

        // Finally phase: no guard short-circuited, so the block ran.
        for finalizer in &self.finalizers {
            match guarded(async { finalizer(ctx.clone()).await }).await {
                Ok(false) => {}
                Ok(true) => break,
                Err(inner) => {
                    self.observe(ctx, &inner);
                    break;
                }
            }
        }

        match failure {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn observe(&self, ctx: &CancellationToken, fault: &Fault) {
        if let Some(hook) = &self.hook {
            hook(ctx.clone(), fault);
        }
    }
}

impl Recycle for Catchable {
    fn build(id: u64) -> Self {
        Self {
            id,
            acquires: 0,
            guards: Vec::new(),
            bodies: Vec::new(),
            catches: Vec::new(),
            finalizers: Vec::new(),
            hook: None,
        }
    }

    fn on_acquire(&mut self) {
        self.acquires += 1;
    }

    fn on_release(&mut self) -> bool {
        self.guards.clear();
        self.bodies.clear();
        self.catches.clear();
        self.finalizers.clear();
        self.hook = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[tokio::test]
    async fn happy_path_runs_bodies_then_finalizers_in_order() {
        let trace: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let t1 = trace.clone();
        let t2 = trace.clone();
        let t3 = trace.clone();
        let outcome = Catchable::acquire()
            .body(move |_ctx| {
                let t = t1.clone();
                async move {
                    t.lock().unwrap().push("b1");
                    false
                }
            })
            .body(move |_ctx| {
                let t = t2.clone();
                async move {
                    t.lock().unwrap().push("b2");
                    false
                }
            })
            .finally(move |_ctx| {
                let t = t3.clone();
                async move {
                    t.lock().unwrap().push("f1");
                    false
                }
            })
            .run(CancellationToken::new())
            .await;

        assert!(outcome.is_ok());
        assert_eq!(*trace.lock().unwrap(), vec!["b1", "b2", "f1"]);
    }

    #[tokio::test]
    async fn body_panic_reaches_catch_finally_and_observer() {
        let caught: Arc<Mutex<Option<Fault>>> = Arc::new(Mutex::new(None));
        let observed = counter();
        let second_body = counter();
        let finalized = counter();

        let caught_in = caught.clone();
        let observed_in = observed.clone();
        let second_in = second_body.clone();
        let finalized_in = finalized.clone();

        let outcome = Catchable::acquire()
            .body(|_ctx| async move { panic!("x") })
            .body(move |_ctx| {
                let c = second_in.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    false
                }
            })
            .catch(move |_ctx, fault| {
                let slot = caught_in.clone();
                async move {
                    *slot.lock().unwrap() = Some(fault);
                    false
                }
            })
            .finally(move |_ctx| {
                let c = finalized_in.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    false
                }
            })
            .on_panic(move |_ctx, _fault| {
                observed_in.fetch_add(1, Ordering::SeqCst);
            })
            .run(CancellationToken::new())
            .await;

        let err = outcome.unwrap_err();
        assert!(err.to_string().contains('x'));
        assert_eq!(second_body.load(Ordering::SeqCst), 0);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        let captured = caught.lock().unwrap().take().unwrap();
        assert!(captured.to_string().contains('x'));
    }

    #[tokio::test]
    async fn guard_short_circuit_skips_every_phase() {
        let ran = counter();

        let b = ran.clone();
        let c = ran.clone();
        let f = ran.clone();
        let outcome = Catchable::acquire()
            .before(|_ctx| async move { true })
            .body(move |_ctx| {
                let n = b.clone();
                async move {
                    n.fetch_add(1, Ordering::SeqCst);
                    false
                }
            })
            .catch(move |_ctx, _fault| {
                let n = c.clone();
                async move {
                    n.fetch_add(1, Ordering::SeqCst);
                    false
                }
            })
            .finally(move |_ctx| {
                let n = f.clone();
                async move {
                    n.fetch_add(1, Ordering::SeqCst);
                    false
                }
            })
            .run(CancellationToken::new())
            .await;

        assert!(outcome.is_ok());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn guard_panic_becomes_the_runs_failure() {
        let observed = counter();
        let finalized = counter();

        let o = observed.clone();
        let f = finalized.clone();
        let outcome = Catchable::acquire()
            .before(|_ctx| async move { panic!("guard down") })
            .finally(move |_ctx| {
                let n = f.clone();
                async move {
                    n.fetch_add(1, Ordering::SeqCst);
                    false
                }
            })
            .on_panic(move |_ctx, _fault| {
                o.fetch_add(1, Ordering::SeqCst);
            })
            .run(CancellationToken::new())
            .await;

        let err = outcome.unwrap_err();
        assert!(err.to_string().contains("guard down"));
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(finalized.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn catch_panic_is_observed_but_does_not_replace_failure() {
        let observed = counter();

        let o = observed.clone();
        let outcome = Catchable::acquire()
            .body(|_ctx| async move { panic!("body down") })
            .catch(|_ctx, _fault| async move { panic!("catch broke too") })
            .on_panic(move |_ctx, _fault| {
                o.fetch_add(1, Ordering::SeqCst);
            })
            .run(CancellationToken::new())
            .await;

        let err = outcome.unwrap_err();
        assert!(err.to_string().contains("body down"));
        // One for the body, one for the catch handler.
        assert_eq!(observed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn true_from_a_finalizer_stops_the_chain() {
        let second = counter();

        let s = second.clone();
        let outcome = Catchable::acquire()
            .body(|_ctx| async move { false })
            .finally(|_ctx| async move { true })
            .finally(move |_ctx| {
                let n = s.clone();
                async move {
                    n.fetch_add(1, Ordering::SeqCst);
                    false
                }
            })
            .run(CancellationToken::new())
            .await;

        assert!(outcome.is_ok());
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_block_returns_ok_and_never_observes() {
        let observed = counter();

        let o = observed.clone();
        let outcome = Catchable::acquire()
            .on_panic(move |_ctx, _fault| {
                o.fetch_add(1, Ordering::SeqCst);
            })
            .run(CancellationToken::new())
            .await;

        assert!(outcome.is_ok());
        assert_eq!(observed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reacquired_instance_carries_no_stale_callbacks() {
        let ran = counter();

        let r = ran.clone();
        let _ = Catchable::acquire()
            .body(move |_ctx| {
                let n = r.clone();
                async move {
                    n.fetch_add(1, Ordering::SeqCst);
                    false
                }
            })
            .run(CancellationToken::new())
            .await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        // A fresh acquisition must not re-run the body registered above.
        let block = Catchable::acquire();
        let (_, acquires) = block.identify();
        assert!(acquires >= 1);
        let outcome = block.run(CancellationToken::new()).await;
        assert!(outcome.is_ok());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
