//! Idle strategy of a scheduler's workers.
//!
//! A worker that finds nothing runnable parks in its scheduler's [`Driver`].
//! The plain scheduler parks on the task queue's condition variable; the I/O
//! manager installs its reactor as the driver so idle workers block in
//! `epoll_wait` and turn readiness into queued tasks while they wait.

use crate::runtime::core::Shared;

use std::any::Any;
use std::sync::Arc;
use std::thread;

pub(crate) trait Driver: Send + Sync + 'static {
    /// Wakes one parked worker.
    fn tickle(&self, shared: &Shared);

    /// Wakes every parked worker.
    fn wake_all(&self, shared: &Shared);

    /// Blocks the calling worker until the queue may hold work for it or the
    /// scheduler is stopping. Spurious returns are allowed.
    fn park(&self, shared: &Shared);

    /// Upcast used to recover the concrete driver from a scheduler handle.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Parks idle workers on the task queue's condition variable.
pub(crate) struct CondvarDriver;

impl Driver for CondvarDriver {
    fn tickle(&self, shared: &Shared) {
        shared.queue().notify_one();
    }

    fn wake_all(&self, shared: &Shared) {
        shared.queue().notify_all();
    }

    fn park(&self, shared: &Shared) {
        shared
            .queue()
            .wait_for_work(thread::current().id(), shared.stopping_flag());
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
