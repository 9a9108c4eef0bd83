//! Readiness-driven I/O on top of the scheduler.
//!
//! - `core`: the epoll reactor driving idle workers, and [`IoManager`]
//! - `event`: event kinds, interest masks, descriptor helpers
//! - `handle`: clonable [`IoHandle`] for use inside tasks
//! - `io`: per-descriptor registration records
//! - `poller`: epoll instance and wake eventfd

pub(crate) mod core;
pub(crate) mod event;
pub(crate) mod handle;
pub(crate) mod io;
mod poller;

pub use self::core::IoManager;
pub use event::{Event, EventMask, set_nonblocking};
pub use handle::IoHandle;
