//! Fluent builder for schedulers and I/O managers.
//!
//! Starts from the process-wide configuration ([`config::global`]) and lets
//! each setting be overridden before building.

use crate::config::{self, RuntimeConfig};
use crate::error::Result;
use crate::reactor::IoManager;
use crate::runtime::Scheduler;

/// Builder for [`Scheduler`] and [`IoManager`] instances.
///
/// # Example
/// ```ignore
/// let io = SchedulerBuilder::new()
///     .threads(4)
///     .name("io")
///     .stack_size(64 * 1024)
///     .build_io()?;
/// ```
#[derive(Debug, Clone)]
pub struct SchedulerBuilder {
    config: RuntimeConfig,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerBuilder {
    /// Creates a builder seeded from the global configuration.
    pub fn new() -> Self {
        Self {
            config: config::global(),
        }
    }

    /// Creates a builder from an explicit configuration.
    pub fn from_config(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Total number of workers, the caller included with `use_caller`.
    pub fn threads(mut self, threads: usize) -> Self {
        self.config.scheduler.threads = threads;
        self
    }

    /// Makes the calling thread one of the workers; it joins through `run`.
    pub fn use_caller(mut self, use_caller: bool) -> Self {
        self.config.scheduler.use_caller = use_caller;
        self
    }

    /// Name used for worker threads (`"{name}-{index}"`) and log fields.
    pub fn name(mut self, name: &str) -> Self {
        self.config.scheduler.name = name.to_string();
        self
    }

    /// Stack size of the fibers wrapping callback tasks.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.config.fiber.stack_size = stack_size;
        self
    }

    /// Events fetched per `epoll_wait`. I/O managers only.
    pub fn max_events(mut self, max_events: usize) -> Self {
        self.config.io.max_events = max_events;
        self
    }

    /// Initial fd table size. I/O managers only.
    pub fn fd_capacity(mut self, capacity: usize) -> Self {
        self.config.io.initial_fd_capacity = capacity;
        self
    }

    /// Builds a stopped scheduler parking idle workers on a condition variable.
    pub fn build(self) -> Scheduler {
        Scheduler::from_config(&self.config)
    }

    /// Builds a stopped I/O manager.
    ///
    /// # Errors
    /// [`Error::Facility`](crate::Error::Facility) if epoll or the eventfd
    /// cannot be created.
    pub fn build_io(self) -> Result<IoManager> {
        IoManager::from_config(&self.config)
    }
}
