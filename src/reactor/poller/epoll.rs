use crate::reactor::event::EventMask;

use libc::{
    EFD_CLOEXEC, EFD_NONBLOCK, EFD_SEMAPHORE, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL,
    EPOLL_CTL_MOD, EPOLLIN, close, epoll_create1, epoll_ctl, epoll_event, epoll_wait, eventfd,
    read, write,
};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

/// Epoll data word of the wake eventfd. Descriptor registrations use the fd
/// itself, which is never this large.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

/// An epoll instance plus the eventfd used to interrupt `epoll_wait`.
///
/// The eventfd runs in semaphore mode and is level-triggered: every token
/// written wakes one waiter, and a waiter that leaves its token unread keeps
/// waking the others.
///
/// Both descriptors can be closed early through [`close`](Poller::close);
/// every later call then fails with `EBADF`.
pub(crate) struct Poller {
    epoll: AtomicI32,
    wake: AtomicI32,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake = unsafe { eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC | EFD_SEMAPHORE) };
        if wake < 0 {
            let err = io::Error::last_os_error();
            unsafe { close(epoll) };
            return Err(err);
        }

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };

        if unsafe { epoll_ctl(epoll, EPOLL_CTL_ADD, wake, &mut event) } < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                close(wake);
                close(epoll);
            }
            return Err(err);
        }

        Ok(Self {
            epoll: AtomicI32::new(epoll),
            wake: AtomicI32::new(wake),
        })
    }

    /// The epoll descriptor, or -1 once closed.
    pub(crate) fn epoll_fd(&self) -> RawFd {
        self.epoll.load(Ordering::Acquire)
    }

    fn wake_fd(&self) -> RawFd {
        self.wake.load(Ordering::Acquire)
    }

    /// Closes both descriptors. Idempotent.
    pub(crate) fn close(&self) {
        for slot in [&self.wake, &self.epoll] {
            let fd = slot.swap(-1, Ordering::AcqRel);
            if fd >= 0 {
                unsafe { close(fd) };
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.epoll_fd() < 0
    }

    /// Moves the kernel registration of `fd` from `previous` to `next`.
    ///
    /// An empty `next` removes the registration. ADD and MOD are each retried
    /// once with the other operation when the kernel disagrees about whether
    /// the descriptor is already registered.
    pub(crate) fn update(&self, fd: RawFd, previous: EventMask, next: EventMask) -> io::Result<()> {
        if next.is_empty() {
            return self.deregister(fd);
        }

        let op = if previous.is_empty() {
            EPOLL_CTL_ADD
        } else {
            EPOLL_CTL_MOD
        };

        match self.ctl(op, fd, next) {
            Err(err) if op == EPOLL_CTL_ADD && err.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(EPOLL_CTL_MOD, fd, next)
            }
            Err(err) if op == EPOLL_CTL_MOD && err.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(EPOLL_CTL_ADD, fd, next)
            }
            result => result,
        }
    }

    fn ctl(&self, op: i32, fd: RawFd, mask: EventMask) -> io::Result<()> {
        let mut event = epoll_event {
            events: mask.epoll_flags(),
            u64: fd as u64,
        };

        if unsafe { epoll_ctl(self.epoll_fd(), op, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        if unsafe { epoll_ctl(self.epoll_fd(), EPOLL_CTL_DEL, fd, ptr::null_mut()) } < 0 {
            let err = io::Error::last_os_error();

            // Already gone: closed descriptors leave the interest list on their own.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF) {
                return Err(err);
            }
        }

        Ok(())
    }

    /// Blocks until something is ready and fills `events`.
    ///
    /// Returns the number of entries written. An interrupted wait returns 0.
    pub(crate) fn wait(&self, events: &mut [epoll_event]) -> io::Result<usize> {
        let capacity = events.len().min(i32::MAX as usize) as i32;
        let count = unsafe { epoll_wait(self.epoll_fd(), events.as_mut_ptr(), capacity, -1) };

        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        Ok(count as usize)
    }

    /// Adds `tokens` wake tokens, each releasing one waiter.
    pub(crate) fn wake(&self, tokens: u64) -> io::Result<()> {
        let value = tokens.max(1);
        let written = unsafe { write(self.wake_fd(), (&raw const value).cast(), size_of::<u64>()) };

        if written < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: waiters are already being woken.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }

        Ok(())
    }

    /// Consumes one wake token, if any is left.
    pub(crate) fn consume_wake(&self) {
        let mut value: u64 = 0;
        unsafe { read(self.wake_fd(), (&raw mut value).cast(), size_of::<u64>()) };
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.close();
    }
}
