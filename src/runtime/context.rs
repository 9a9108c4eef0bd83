//! Thread-local scheduler context.
//!
//! Every worker thread records the scheduler it serves so code running inside
//! tasks can reach it without an explicit handle: [`Scheduler::current`],
//! [`IoManager::current`] and socket-style teardown code all go through
//! [`current_handle`].
//!
//! [`Scheduler::current`]: crate::runtime::Scheduler::current
//! [`IoManager::current`]: crate::reactor::IoManager::current

use crate::runtime::Handle;

use std::cell::RefCell;

thread_local! {
    /// Scheduler served by this thread, if any.
    ///
    /// Set by [`enter_context`] when a worker loop starts.
    static CURRENT_SCHEDULER: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

/// Installs `handle` as the current scheduler while `function` runs.
///
/// The previous context is restored afterwards, so nested schedulers on one
/// thread behave.
pub(crate) fn enter_context<F, R>(handle: Handle, function: F) -> R
where
    F: FnOnce() -> R,
{
    let previous = CURRENT_SCHEDULER.with(|current| current.borrow_mut().replace(handle));

    let result = function();

    CURRENT_SCHEDULER.with(|current| *current.borrow_mut() = previous);

    result
}

/// Returns the scheduler served by the calling thread.
pub(crate) fn current_handle() -> Option<Handle> {
    CURRENT_SCHEDULER.with(|current| current.borrow().clone())
}
