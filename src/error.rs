//! # Error types used by the taskwarden runtime.
//!
//! Two enums cover the whole failure surface:
//!
//! - [`Fault`] - structured failure values produced by callback execution:
//!   a captured panic, or a task configured without a handler.
//! - [`RuntimeError`] - lifecycle misuse raised by the runtime itself
//!   (double start, submitting to a stopped service, and so on).
//!
//! Both types provide `as_label` returning a short stable label for logs.
//! No untyped panic ever escapes the library: every callback boundary runs
//! under a shield that converts the payload into a [`Fault`].

use std::any::Any;

use thiserror::Error;

/// # A captured abnormal termination of a callback.
///
/// Panic payloads are freely typed; the shield coerces them into this tagged
/// form by downcasting the common string payloads.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// A callback panicked; `message` is the rendered panic payload.
    #[error("callback panic: {message}")]
    Panic { message: String },

    /// A task was run without a handler callback.
    #[error("handler callback not defined")]
    HandlerMissing,
}

impl Fault {
    /// Builds a `Fault` from a captured panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&'static str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "unknown panic".to_string()
        };
        Fault::Panic { message }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Fault::Panic { .. } => "fault_panic",
            Fault::HandlerMissing => "fault_handler_missing",
        }
    }
}

/// # Errors produced by the runtime lifecycle itself.
///
/// Per-task failures never appear here; they are isolated inside the task
/// and reported through its result.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// `Processor::start` was called while the processor is running.
    #[error("processor '{name}' is running already")]
    RunningAlready {
        /// The processor's name.
        name: String,
    },

    /// `Service::start` was called while the service is running.
    #[error("service started already")]
    StartedAlready,

    /// `Service::add` was called before start, or during shutdown.
    #[error("service not started or stopping")]
    NotAccepting,

    /// A before/after callback surfaced a failure.
    #[error(transparent)]
    Callback(#[from] Fault),
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::RunningAlready { .. } => "runtime_running_already",
            RuntimeError::StartedAlready => "runtime_started_already",
            RuntimeError::NotAccepting => "runtime_not_accepting",
            RuntimeError::Callback(f) => f.as_label(),
        }
    }
}
