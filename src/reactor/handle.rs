use crate::error::Result;
use crate::fiber::Fiber;
use crate::reactor::core::Reactor;
use crate::reactor::event::{Event, EventMask};
use crate::runtime::Handle;
use crate::task::Task;

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Clonable access to an [`IoManager`](crate::IoManager)'s registrations.
///
/// This is what tasks get from [`IoManager::current`](crate::IoManager::current).
/// It never owns the worker pool: dropping it stops nothing.
#[derive(Clone)]
pub struct IoHandle {
    scheduler: Handle,
    reactor: Arc<Reactor>,
}

impl IoHandle {
    pub(crate) fn new(scheduler: Handle, reactor: Arc<Reactor>) -> Self {
        Self { scheduler, reactor }
    }

    /// Registers interest in `event` on `fd`; see
    /// [`IoManager::add_event`](crate::IoManager::add_event).
    pub fn add_event(&self, fd: RawFd, event: Event, task: Option<Task>) -> Result<()> {
        self.reactor
            .add_event(self.scheduler.shared(), fd, event, task)
    }

    /// Removes the registration of `event` on `fd`. The follow-up is dropped
    /// without running.
    ///
    /// # Arguments
    /// * `fd` - Descriptor the event was registered on
    /// * `event` - Direction to remove
    ///
    /// # Returns
    /// `false` if `event` was not registered on `fd`.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.del_event(fd, event)
    }

    /// Removes the registration of `event` on `fd` and queues its follow-up
    /// as if the event had fired.
    ///
    /// # Returns
    /// `false` if `event` was not registered on `fd`.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.cancel_event(fd, event)
    }

    /// Cancels both directions on `fd`, queueing every follow-up, and removes
    /// the descriptor from epoll.
    ///
    /// # Returns
    /// `false` if nothing was registered on `fd`.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor.cancel_all(fd)
    }

    /// Registers the calling fiber for `event` on `fd` and parks it.
    ///
    /// Returns once the event fires or the registration is cancelled; which
    /// one happened is not reported, so callers retry their I/O and expect
    /// `EAGAIN` after a cancellation.
    ///
    /// # Errors
    /// Everything [`add_event`](IoHandle::add_event) returns. Called outside
    /// a fiber this is [`Error::InvalidArgument`](crate::Error::InvalidArgument).
    ///
    /// # Example
    /// ```ignore
    /// let io = IoManager::current().unwrap();
    /// loop {
    ///     match read_nonblocking(fd, &mut buf) {
    ///         Err(e) if e.kind() == io::ErrorKind::WouldBlock => io.wait(fd, Event::Read)?,
    ///         other => break other,
    ///     }
    /// }
    /// ```
    pub fn wait(&self, fd: RawFd, event: Event) -> Result<()> {
        self.add_event(fd, event, None)?;

        Fiber::yield_to_hold()
    }

    /// Events currently registered on `fd`.
    pub fn registered(&self, fd: RawFd) -> EventMask {
        self.reactor.registered(fd)
    }

    /// Registered (fd, event) pairs still waiting to fire.
    pub fn pending_event_count(&self) -> usize {
        self.reactor.pending()
    }

    /// Scheduler the follow-ups are queued on.
    pub fn scheduler(&self) -> &Handle {
        &self.scheduler
    }

    pub(crate) fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }
}

impl fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoHandle")
            .field("scheduler", &self.scheduler)
            .field("pending_events", &self.pending_event_count())
            .finish()
    }
}
