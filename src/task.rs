//! Units of work accepted by the scheduler.
//!
//! A [`Task`] is either a fiber to resume or a plain callback. Callbacks are
//! wrapped in a fiber by the worker that picks them up, so every task runs with
//! a fiber context and may yield.
//!
//! ```ignore
//! use spindle::{Fiber, Task};
//!
//! let fiber = Fiber::new(|| println!("in a fiber"))?;
//! scheduler.submit(Task::fiber(fiber), None);
//! scheduler.submit(Task::callback(|| println!("in a callback")), None);
//! ```

use crate::fiber::Fiber;

use std::fmt;
use std::sync::Arc;

/// Boxed callback payload.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work: exactly one of a fiber or a callback.
pub enum Task {
    /// Resume this fiber.
    Fiber(Arc<Fiber>),
    /// Run this closure inside a worker-provided fiber.
    Callback(Callback),
}

impl Task {
    /// Wraps a fiber.
    pub fn fiber(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }

    /// Wraps a closure.
    pub fn callback<F>(callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Callback(Box::new(callback))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl From<Callback> for Task {
    fn from(callback: Callback) -> Self {
        Task::Callback(callback)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Task::Callback(_) => f.write_str("Callback"),
        }
    }
}
