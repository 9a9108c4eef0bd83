//! Error type shared by fibers, the scheduler and the I/O manager.
//!
//! Per-call failures (bad descriptor, duplicate registration, illegal fiber
//! state) are returned to the caller. Nothing in this enum is ever raised
//! through a worker loop: task panics are contained at the fiber boundary.

use crate::fiber::FiberState;
use crate::reactor::event::Event;

use std::io;
use std::os::unix::io::RawFd;

/// Errors produced by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A negative descriptor, or a missing body/fiber where one is required.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The event bit is already registered for this descriptor.
    #[error("{event} interest already registered for fd {fd}")]
    AlreadyRegistered { fd: RawFd, event: Event },

    /// The fiber stack could not be allocated.
    #[error("failed to allocate a {size} byte fiber stack")]
    StackAllocation { size: usize },

    /// A runtime table could not grow.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The kernel facility (epoll, eventfd, ucontext) rejected a request.
    #[error("readiness facility failure: {0}")]
    Facility(#[from] io::Error),

    /// Main fibers own no stack and can never be reset or given a body.
    #[error("operation not permitted on a main fiber")]
    MainFiber,

    /// The fiber is not in a state that allows the requested operation.
    #[error("fiber {id} is in state {state}")]
    InvalidState { id: u64, state: FiberState },

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(io::Error),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
