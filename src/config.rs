//! Runtime configuration.
//!
//! Values can be set programmatically, deserialized with `serde` from any
//! format the application prefers, or read from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SPINDLE_STACK_SIZE` | Fiber stack size in bytes | 131072 (128 KiB) |
//! | `SPINDLE_THREADS` | Worker threads per scheduler | 1 |
//! | `SPINDLE_USE_CALLER` | Caller thread joins the pool ("true"/"false") | false |
//! | `SPINDLE_NAME` | Scheduler name used for thread names and logs | spindle |
//! | `SPINDLE_MAX_EVENTS` | Events fetched per `epoll_wait` | 256 |
//! | `SPINDLE_FD_CAPACITY` | Initial fd table capacity | 128 |
//!
//! None of these values affect scheduling correctness; they only tune sizes.
//!
//! # Example
//!
//! ```ignore
//! use spindle::config::{self, RuntimeConfig};
//!
//! let config = RuntimeConfig::from_env();
//! config::set_global(config);
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::OnceLock;

/// Default fiber stack size (128 KiB).
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

const DEFAULT_MAX_EVENTS: usize = 256;
const DEFAULT_FD_CAPACITY: usize = 128;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Fiber settings.
    #[serde(default)]
    pub fiber: FiberConfig,
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// I/O manager settings.
    #[serde(default)]
    pub io: IoConfig,
}

/// Fiber configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FiberConfig {
    /// Stack size used when a fiber is created without an explicit size.
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Total number of workers, including the caller when `use_caller` is set.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Whether the constructing thread joins the pool through `Scheduler::run`.
    #[serde(default)]
    pub use_caller: bool,
    /// Name used for worker thread names and log fields.
    #[serde(default = "default_name")]
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            use_caller: false,
            name: default_name(),
        }
    }
}

/// I/O manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IoConfig {
    /// Maximum events returned by a single `epoll_wait`.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Number of fd slots allocated up front. The table doubles on demand.
    #[serde(default = "default_fd_capacity")]
    pub initial_fd_capacity: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            initial_fd_capacity: DEFAULT_FD_CAPACITY,
        }
    }
}

fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

fn default_threads() -> usize {
    1
}

fn default_name() -> String {
    "spindle".to_string()
}

fn default_max_events() -> usize {
    DEFAULT_MAX_EVENTS
}

fn default_fd_capacity() -> usize {
    DEFAULT_FD_CAPACITY
}

impl RuntimeConfig {
    /// Builds a configuration from `SPINDLE_*` environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = env_parse("SPINDLE_STACK_SIZE") {
            config.fiber.stack_size = size;
        }
        if let Some(threads) = env_parse("SPINDLE_THREADS") {
            config.scheduler.threads = threads;
        }
        if let Some(use_caller) = env::var("SPINDLE_USE_CALLER").ok().and_then(|v| parse_bool(&v)) {
            config.scheduler.use_caller = use_caller;
        }
        if let Ok(name) = env::var("SPINDLE_NAME")
            && !name.is_empty()
        {
            config.scheduler.name = name;
        }
        if let Some(max_events) = env_parse("SPINDLE_MAX_EVENTS") {
            config.io.max_events = max_events;
        }
        if let Some(capacity) = env_parse("SPINDLE_FD_CAPACITY") {
            config.io.initial_fd_capacity = capacity;
        }

        config.normalized()
    }

    /// Clamps values that would make the runtime unusable.
    pub fn normalized(mut self) -> Self {
        if self.fiber.stack_size == 0 {
            self.fiber.stack_size = DEFAULT_STACK_SIZE;
        }
        if self.scheduler.threads == 0 {
            self.scheduler.threads = 1;
        }
        if self.io.max_events == 0 {
            self.io.max_events = DEFAULT_MAX_EVENTS;
        }
        if self.io.initial_fd_capacity == 0 {
            self.io.initial_fd_capacity = 1;
        }
        self
    }
}

fn env_parse(key: &str) -> Option<usize> {
    env::var(key).ok()?.trim().parse().ok()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

static GLOBAL: OnceLock<RwLock<RuntimeConfig>> = OnceLock::new();

fn global_cell() -> &'static RwLock<RuntimeConfig> {
    GLOBAL.get_or_init(|| RwLock::new(RuntimeConfig::default()))
}

/// Installs the process-wide default configuration.
///
/// Only affects fibers and schedulers created afterwards.
pub fn set_global(config: RuntimeConfig) {
    *global_cell().write() = config.normalized();
}

/// Returns a copy of the process-wide default configuration.
pub fn global() -> RuntimeConfig {
    global_cell().read().clone()
}

/// Default stack size for fibers created without an explicit size.
pub(crate) fn default_fiber_stack_size() -> usize {
    global_cell().read().fiber.stack_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_replaces_zeroes() {
        let mut config = RuntimeConfig::default();
        config.fiber.stack_size = 0;
        config.scheduler.threads = 0;
        config.io.max_events = 0;

        let config = config.normalized();
        assert_eq!(config.fiber.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.scheduler.threads, 1);
        assert_eq!(config.io.max_events, DEFAULT_MAX_EVENTS);
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
