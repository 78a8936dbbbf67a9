//! # Callback shapes understood by the runtime.
//!
//! Every callback receives a [`CancellationToken`] as its context and is
//! expected to check it cooperatively; none is ever forcibly interrupted.
//! The boolean returned by the phase callbacks means "skip the rest of this
//! phase" - `true` stops the surrounding loop, `false` continues it.
//!
//! All shapes are `Arc`-wrapped so registered vectors can be snapshotted and
//! invoked without holding a lock across an await.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Fault;

/// Pre-phase guard: returning `true` skips the remaining guards *and* the
/// whole block they guard.
pub type Guard = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, bool> + Send + Sync>;

/// Body callback: runs inside the shielded block; may fail by panicking.
pub type Body = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, bool> + Send + Sync>;

/// Catch handler: observes the captured failure; `true` skips further
/// handlers.
pub type CatchHook = Arc<dyn Fn(CancellationToken, Fault) -> BoxFuture<'static, bool> + Send + Sync>;

/// Finalizer: runs after the body phase; `true` skips further finalizers.
pub type Finalizer = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, bool> + Send + Sync>;

/// Side-effect observer invoked once for every captured panic.
pub type PanicHook = Arc<dyn Fn(CancellationToken, &Fault) + Send + Sync>;

/// Long-running processor body; cancellation arrives through the token.
pub type ProcessBody = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, bool> + Send + Sync>;
