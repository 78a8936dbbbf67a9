//! Immutable record of a single task execution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::Fault;
use crate::task::Payload;

static RESULT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Outcome of one [`Task`](crate::Task) run, delivered to the finish
/// callback.
///
/// Timing fields:
/// - `created` - when the task was acquired from the pool,
/// - `begin` - when the handler started,
/// - `finish` - when the handler returned or panicked,
/// - `duration_ms = finish − begin`, `delay_ms = begin − created`
///   (queue delay).
pub struct TaskResult {
    id: u64,

    /// Task acquire time.
    pub created: Instant,
    /// Handler start time.
    pub begin: Instant,
    /// Handler end time.
    pub finish: Instant,
    /// Handler wall time, milliseconds.
    pub duration_ms: u64,
    /// Acquire-to-start queue delay, milliseconds.
    pub delay_ms: u64,
    /// Failures captured during the run, in order.
    pub errors: Vec<Fault>,
    /// Whatever the handler returned; `None` on failure.
    pub returned: Option<Payload>,
}

impl TaskResult {
    pub(crate) fn new(created: Instant) -> Self {
        let now = Instant::now();
        Self {
            id: RESULT_SEQ.fetch_add(1, Ordering::Relaxed) + 1,
            created,
            begin: now,
            finish: now,
            duration_ms: 0,
            delay_ms: 0,
            errors: Vec::new(),
            returned: None,
        }
    }

    pub(crate) fn close(&mut self) {
        self.duration_ms = self.finish.duration_since(self.begin).as_millis() as u64;
        self.delay_ms = self.begin.duration_since(self.created).as_millis() as u64;
    }

    /// The result's own monotonic id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether any failure was recorded.
    pub fn has_error(&self) -> bool {
        !self.errors.is_empty()
    }
}
