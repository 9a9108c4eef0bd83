//! Epoll-driven I/O manager.
//!
//! The [`Reactor`] is the scheduler driver of an [`IoManager`]: idle workers
//! block in `epoll_wait` instead of a condition variable, and every readiness
//! event they collect turns the registered follow-up into a queued task.
//!
//! Registrations are edge-triggered and one-shot. Once an event fires (or is
//! cancelled) its bit is cleared and the follow-up is queued exactly once;
//! waiting again means registering again.

use crate::builder::SchedulerBuilder;
use crate::config::{self, RuntimeConfig};
use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::reactor::event::{Event, EventMask};
use crate::reactor::handle::IoHandle;
use crate::reactor::io::{FdContext, FdState, Fired};
use crate::reactor::poller::{Poller, WAKE_TOKEN};
use crate::runtime::core::Shared;
use crate::runtime::driver::Driver;
use crate::runtime::{Handle, Scheduler};
use crate::task::Task;
use crate::utils::table::FdTable;

use libc::epoll_event;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::{debug, error, warn};

thread_local! {
    /// Readiness buffer of the worker parked on this thread, reused across
    /// idle cycles.
    static EVENTS: RefCell<Vec<epoll_event>> = const { RefCell::new(Vec::new()) };
}

/// Registration table plus the epoll instance idle workers block on.
pub(crate) struct Reactor {
    poller: Poller,
    table: FdTable,
    /// Registered (fd, event) pairs across the whole table.
    pending: AtomicUsize,
    max_events: usize,
}

impl Reactor {
    pub(crate) fn new(config: &config::IoConfig) -> Result<Self> {
        let poller = Poller::new()?;

        Ok(Self {
            poller,
            table: FdTable::new(config.initial_fd_capacity),
            pending: AtomicUsize::new(0),
            max_events: config.max_events.max(1),
        })
    }

    pub(crate) fn add_event(
        &self,
        scheduler: &Arc<Shared>,
        fd: RawFd,
        event: Event,
        task: Option<Task>,
    ) -> Result<()> {
        if fd < 0 {
            return Err(Error::InvalidArgument("negative file descriptor"));
        }

        let task = match task {
            Some(task) => task,
            None => {
                let fiber = Fiber::current();
                if fiber.is_main() {
                    return Err(Error::InvalidArgument(
                        "no task given and not running inside a fiber",
                    ));
                }
                Task::Fiber(fiber)
            }
        };

        let context = self.table.get_or_insert(fd)?;
        let mut state = context.state.lock();

        if state.events.contains(event) {
            return Err(Error::AlreadyRegistered { fd, event });
        }

        let next = state.events | event.mask();
        self.poller.update(fd, state.events, next)?;

        state.arm(event, Arc::downgrade(scheduler), task);
        state.events = next;
        self.pending.fetch_add(1, Ordering::SeqCst);

        debug!(fd = context.fd(), %event, "event registered");
        Ok(())
    }

    pub(crate) fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(context) = self.table.get(fd) else {
            return false;
        };
        let mut state = context.state.lock();

        match self.release(&context, &mut state, event.mask()) {
            // Dropped after the lock: a callback may own arbitrary captures.
            Some(removed) => {
                drop(state);
                drop(removed);
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(context) = self.table.get(fd) else {
            return false;
        };
        let mut state = context.state.lock();

        match self.release(&context, &mut state, event.mask()) {
            Some(fired) => {
                drop(state);
                fired.into_iter().for_each(Fired::dispatch);
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(context) = self.table.get(fd) else {
            return false;
        };
        let mut state = context.state.lock();

        match self.release(&context, &mut state, EventMask::BOTH) {
            Some(fired) => {
                drop(state);
                fired.into_iter().for_each(Fired::dispatch);
                true
            }
            None => false,
        }
    }

    /// Clears `events` from a locked record and moves their follow-ups out.
    ///
    /// Returns `None` when none of the bits were registered. A kernel refusal
    /// (typically `EBADF` for a descriptor closed while still registered) is
    /// logged and the bits are cleared anyway, so no follow-up is stranded.
    fn release(
        &self,
        context: &FdContext,
        state: &mut FdState,
        events: EventMask,
    ) -> Option<Vec<Fired>> {
        let released = state.events & events;
        if released.is_empty() {
            return None;
        }

        let remaining = state.events.without(released);
        if let Err(err) = self.poller.update(context.fd(), state.events, remaining) {
            warn!(fd = context.fd(), %err, "epoll update failed while releasing events");
        }
        state.events = remaining;

        let fired: Vec<Fired> = Event::ALL
            .into_iter()
            .filter(|event| released.contains(*event))
            .filter_map(|event| state.take(event))
            .collect();

        self.pending.fetch_sub(fired.len(), Ordering::SeqCst);
        debug!(fd = context.fd(), released = fired.len(), "events released");

        Some(fired)
    }

    /// Handles one readiness report for a registered descriptor.
    fn trigger(&self, fd: RawFd, flags: u32) {
        let Some(context) = self.table.get(fd) else {
            return;
        };

        let ready = EventMask::from_ready(flags);
        let mut state = context.state.lock();

        if let Some(fired) = self.release(&context, &mut state, ready) {
            drop(state);
            fired.into_iter().for_each(Fired::dispatch);
        }
    }

    pub(crate) fn registered(&self, fd: RawFd) -> EventMask {
        self.table
            .get(fd)
            .map_or(EventMask::NONE, |context| context.state.lock().events)
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn wake(&self, tokens: u64) {
        if self.poller.is_closed() {
            return;
        }

        if let Err(err) = self.poller.wake(tokens) {
            error!(%err, "failed to write the wake eventfd");
        }
    }

    /// Drops every registration and closes the epoll and eventfd descriptors.
    ///
    /// Follow-ups are dropped, never run. This breaks the cycle formed by
    /// follow-ups that hold a handle back to the manager, and releases the
    /// descriptors even when a parked fiber's stack keeps a handle alive.
    fn shutdown(&self) {
        let records = self.table.drain();

        let mut dropped = Vec::new();
        for record in &records {
            let mut state = record.state.lock();
            let events = state.events;
            dropped.extend(Event::ALL.into_iter().filter_map(|event| state.take(event)));
            state.events = EventMask::NONE;
            drop(state);

            if !events.is_empty() {
                let _ = self.poller.update(record.fd(), events, EventMask::NONE);
            }
        }

        self.pending.store(0, Ordering::SeqCst);
        self.poller.close();

        debug!(dropped = dropped.len(), "reactor shut down");
        drop(dropped);
    }
}

impl Driver for Reactor {
    fn tickle(&self, shared: &Shared) {
        self.wake(1);
        shared.queue().notify_one();
    }

    fn wake_all(&self, shared: &Shared) {
        self.wake(shared.thread_count() as u64);
        shared.queue().notify_all();
    }

    fn park(&self, shared: &Shared) {
        let me = thread::current().id();

        // Paired with the idle counter: a submitter either sees this worker
        // idle and writes a token, or its task is visible here.
        if shared.is_stopping() || self.poller.is_closed() || shared.queue().has_work_for(me) {
            return;
        }

        // Taken out of the slot so dispatching never holds the borrow.
        let mut events = EVENTS.with(|slot| slot.take());
        if events.len() < self.max_events {
            events.resize(self.max_events, epoll_event { events: 0, u64: 0 });
        }

        let count = match self.poller.wait(&mut events[..self.max_events]) {
            Ok(count) => count,
            Err(err) => {
                error!(scheduler = %shared.name(), %err, "epoll_wait failed");
                EVENTS.with(|slot| *slot.borrow_mut() = events);
                return;
            }
        };

        for event in events.iter().take(count).copied() {
            let (flags, token) = (event.events, event.u64);

            if token == WAKE_TOKEN {
                // Left unread while stopping so every worker sees it.
                if !shared.is_stopping() {
                    self.poller.consume_wake();
                }
                continue;
            }

            self.trigger(token as RawFd, flags);
        }

        EVENTS.with(|slot| *slot.borrow_mut() = events);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A scheduler whose idle workers wait for descriptor readiness.
///
/// Owns the worker pool: dropping the manager stops the scheduler (joining
/// its workers), drops every registered follow-up without running it, and
/// closes the epoll and eventfd descriptors. Handles that outlive the manager
/// stay safe to call but every registration fails.
///
/// # Example
/// ```ignore
/// use spindle::{Event, IoManager, Task};
///
/// let io = IoManager::new(2, false, "io")?;
/// io.start()?;
///
/// io.add_event(fd, Event::Read, Some(Task::callback(move || {
///     // fd is readable
/// })))?;
/// ```
pub struct IoManager {
    scheduler: Scheduler,
    io: IoHandle,
}

impl IoManager {
    /// Creates a stopped I/O manager with the given pool shape and the global
    /// configuration for everything else.
    ///
    /// # Errors
    /// [`Error::Facility`] if epoll or the eventfd cannot be created.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Self> {
        SchedulerBuilder::new()
            .threads(threads)
            .use_caller(use_caller)
            .name(name)
            .build_io()
    }

    /// Creates a stopped I/O manager from a full configuration.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let config = config.clone().normalized();

        let reactor = Arc::new(Reactor::new(&config.io)?);
        let driver: Arc<dyn Driver> = reactor.clone();
        let scheduler =
            Scheduler::with_driver(&config.scheduler, config.fiber.stack_size, driver);

        let io = IoHandle::new(scheduler.handle(), reactor);

        Ok(Self { scheduler, io })
    }

    /// I/O handle of the manager driving the calling worker thread.
    ///
    /// Returns `None` outside worker threads and on workers of a plain
    /// [`Scheduler`].
    pub fn current() -> Option<IoHandle> {
        let scheduler: Handle = Scheduler::current()?;
        let reactor = scheduler.driver().as_any().downcast::<Reactor>().ok()?;

        Some(IoHandle::new(scheduler, reactor))
    }

    /// Spawns the worker threads; see [`Scheduler::start`].
    pub fn start(&self) -> Result<()> {
        self.scheduler.start()
    }

    /// Stops the worker pool. Registrations survive until the manager is
    /// dropped.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Runs the worker loop on the calling thread until stopped.
    pub fn run(&self) {
        self.scheduler.run();
    }

    /// The underlying scheduler, for submitting plain tasks.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// A clonable handle usable from tasks and other threads.
    pub fn handle(&self) -> IoHandle {
        self.io.clone()
    }

    /// Registers interest in `event` on `fd`.
    ///
    /// `task` runs once when the event fires or is cancelled. `None`
    /// registers the calling fiber, which is resumed instead.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] for a negative fd, or `None` outside a fiber.
    /// - [`Error::AlreadyRegistered`] if the event is already registered.
    /// - [`Error::Facility`] if epoll rejects the registration.
    pub fn add_event(&self, fd: RawFd, event: Event, task: Option<Task>) -> Result<()> {
        self.io.add_event(fd, event, task)
    }

    /// Removes a registration without running its follow-up.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.io.del_event(fd, event)
    }

    /// Removes a registration and queues its follow-up as if it fired.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.io.cancel_event(fd, event)
    }

    /// Cancels both events on `fd` and removes it from epoll.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.io.cancel_all(fd)
    }

    /// Parks the calling fiber until `event` fires on `fd`.
    pub fn wait(&self, fd: RawFd, event: Event) -> Result<()> {
        self.io.wait(fd, event)
    }

    /// Events currently registered on `fd`.
    pub fn registered(&self, fd: RawFd) -> EventMask {
        self.io.registered(fd)
    }

    /// Registered (fd, event) pairs still waiting to fire.
    pub fn pending_event_count(&self) -> usize {
        self.io.pending_event_count()
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.scheduler)
            .field("pending_events", &self.pending_event_count())
            .finish()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.scheduler.stop();
        self.io.reactor().shutdown();
    }
}
