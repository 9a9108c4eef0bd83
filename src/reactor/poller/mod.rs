//! Kernel readiness facility.

mod epoll;

pub(crate) use epoll::{Poller, WAKE_TOKEN};
