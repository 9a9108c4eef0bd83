//! Per-descriptor registration state.

use crate::reactor::event::{Event, EventMask};
use crate::runtime::core::Shared;
use crate::task::Task;

use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::Weak;

/// Follow-up for one direction of one descriptor.
#[derive(Default)]
pub(crate) struct EventContext {
    scheduler: Option<Weak<Shared>>,
    task: Option<Task>,
}

/// A follow-up moved out of its descriptor, ready to be queued.
pub(crate) struct Fired {
    scheduler: Weak<Shared>,
    task: Task,
}

impl Fired {
    /// Queues the task on the scheduler that registered it. Does nothing if
    /// that scheduler is gone.
    pub(crate) fn dispatch(self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.submit(self.task, None);
        }
    }
}

/// Registered mask plus both follow-ups. A follow-up is present exactly when
/// its bit is set.
#[derive(Default)]
pub(crate) struct FdState {
    pub(crate) events: EventMask,
    read: EventContext,
    write: EventContext,
}

impl FdState {
    fn context_mut(&mut self, event: Event) -> &mut EventContext {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Stores the follow-up for `event`. The caller sets the bit.
    pub(crate) fn arm(&mut self, event: Event, scheduler: Weak<Shared>, task: Task) {
        let context = self.context_mut(event);
        context.scheduler = Some(scheduler);
        context.task = Some(task);
    }

    /// Moves the follow-up for `event` out. The caller clears the bit.
    pub(crate) fn take(&mut self, event: Event) -> Option<Fired> {
        let context = self.context_mut(event);
        let scheduler = context.scheduler.take()?;
        let task = context.task.take()?;

        Some(Fired { scheduler, task })
    }
}

/// Registration record of one descriptor.
pub(crate) struct FdContext {
    fd: RawFd,
    pub(crate) state: Mutex<FdState>,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: Mutex::new(FdState::default()),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }
}
