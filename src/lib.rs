//! # taskwarden
//!
//! **Taskwarden** is a small in-process supervised task runtime.
//!
//! Every callback runs under a failure shield, hot-path instances are pooled
//! and recycled, and composition is the unit of behavior. The crate is a
//! building block for long-running services that need failure isolation,
//! bounded fan-out and restartable workers inside one process.
//!
//! ## Features
//!
//! | Area            | Description                                                             | Key types                    |
//! |-----------------|-------------------------------------------------------------------------|------------------------------|
//! | **Isolation**   | Structured guard/body/catch/finally blocks with panic containment.      | [`Catchable`]                |
//! | **Tasks**       | Pooled one-shot units of work with handler and finish callbacks.        | [`Task`], [`TaskResult`]     |
//! | **Fan-out**     | Bounded-parallelism execution of a fixed task set.                      | [`Batch`]                    |
//! | **Services**    | Long-lived accepting queues with dynamic parallelism.                   | [`Service`]                  |
//! | **Supervision** | Restartable before/main/after workers with composable children.         | [`Processor`]                |
//! | **Errors**      | Structured failure values; no panic escapes the library.                | [`Fault`], [`RuntimeError`]  |
//!
//! ## Example
//!
//! ```no_run
//! use taskwarden::{Batch, Task, payload};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let batch = Batch::acquire();
//!     batch.set_parallel(4);
//!
//!     for n in 0..16_u32 {
//!         batch.add(
//!             Task::acquire()
//!                 .context(CancellationToken::new())
//!                 .handler_fn(move |_ctx| async move { Some(payload(n * n)) })
//!                 .finish(|_ctx, res| async move {
//!                     println!("task {} ok={}", res.id(), !res.has_error());
//!                 }),
//!         );
//!     }
//!
//!     let (total, success) = batch.run().await;
//!     assert_eq!((total, success), (16, 16));
//! }
//! ```
//!
//! Cancellation is cooperative everywhere: callbacks receive a
//! [`CancellationToken`](tokio_util::sync::CancellationToken) and are
//! expected to poll it; nothing is forcibly interrupted.

mod batch;
mod callback;
mod catchable;
mod error;
mod pool;
mod processor;
mod service;
mod shield;
mod task;
mod task_result;

// ---- Public re-exports ----

pub use batch::Batch;
pub use callback::{Body, CatchHook, Finalizer, Guard, PanicHook, ProcessBody};
pub use catchable::Catchable;
pub use error::{Fault, RuntimeError};
pub use processor::Processor;
pub use service::Service;
pub use task::{payload, Handler, HandlerFn, Payload, Task};
pub use task_result::TaskResult;
