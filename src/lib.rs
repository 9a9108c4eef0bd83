//! Stackful fibers, an N:M scheduler and an epoll-driven I/O manager.
//!
//! This crate runs cooperative coroutines over a fixed pool of OS threads and
//! turns descriptor readiness into scheduled work.
//!
//! # Architecture
//!
//! - **Fiber**: stackful coroutine with its own mmap'd stack and saved context;
//!   explicit `resume` / `yield_to_ready` / `yield_to_hold`
//! - **Task**: a fiber to resume or a callback to run inside a fiber
//! - **Scheduler**: worker threads sharing one FIFO queue, with optional
//!   per-task thread affinity
//! - **IoManager**: a scheduler whose idle workers block in edge-triggered
//!   `epoll_wait` and queue the follow-ups of ready descriptors
//! - **SchedulerBuilder**: fluent construction from the global configuration
//! - **config** / **logger**: `SPINDLE_*` configuration and a `tracing`
//!   subscriber helper
//!
//! # Example
//!
//! ```ignore
//! use spindle::{Event, IoManager, Task};
//!
//! let io = IoManager::new(2, false, "io")?;
//! io.start()?;
//!
//! io.scheduler().spawn(move || {
//!     let io = IoManager::current().unwrap();
//!     io.wait(fd, Event::Read).unwrap();
//!     // fd is readable
//! });
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("spindle needs Linux: it is built on epoll, eventfd and ucontext");

mod builder;
pub mod config;
mod error;
mod fiber;
pub mod logger;
mod reactor;
mod runtime;
mod task;
mod utils;

pub use builder::SchedulerBuilder;
pub use error::{Error, Result};
pub use fiber::{Fiber, FiberState};
pub use reactor::{Event, EventMask, IoHandle, IoManager, set_nonblocking};
pub use runtime::{Handle, Scheduler};
pub use task::{Callback, Task};
