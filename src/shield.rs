//! Panic shield interposed at every callback boundary.
//!
//! [`guarded`] drives a future under `catch_unwind` and coerces a captured
//! panic payload into a [`Fault`]. Callers pass the callback invocation
//! wrapped in an `async` block so that a panic raised while *creating* the
//! future is captured as well.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use crate::error::Fault;

/// Runs `fut` to completion, converting a panic into a [`Fault`].
///
/// `AssertUnwindSafe` is deliberate: callbacks are opaque and may share
/// state; a panicking callback can leave that state inconsistent, which is
/// the caller's contract to manage.
pub(crate) async fn guarded<T, F>(fut: F) -> Result<T, Fault>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(v) => Ok(v),
        Err(payload) => Err(Fault::from_panic(payload)),
    }
}
