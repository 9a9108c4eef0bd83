//! Scheduler subsystem modules.

pub(crate) mod context;
pub(crate) mod core;
pub(crate) mod driver;
pub(crate) mod queue;

pub use self::core::{Handle, Scheduler};
