//! Readiness kinds and interest masks.

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, F_GETFL, F_SETFL, O_NONBLOCK, fcntl};
use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr};
use std::os::unix::io::RawFd;

/// Direction of readiness on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    /// Both events, read first.
    pub(crate) const ALL: [Event; 2] = [Event::Read, Event::Write];

    pub fn mask(self) -> EventMask {
        match self {
            Event::Read => EventMask::READ,
            Event::Write => EventMask::WRITE,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Read => f.write_str("read"),
            Event::Write => f.write_str("write"),
        }
    }
}

/// Set of registered events: none, read, write or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(0b01);
    pub const WRITE: Self = Self(0b10);
    pub const BOTH: Self = Self(0b11);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, event: Event) -> bool {
        self.0 & event.mask().0 != 0
    }

    /// This mask with every bit of `other` cleared.
    pub fn without(self, other: EventMask) -> Self {
        Self(self.0 & !other.0)
    }

    /// Edge-triggered epoll flags for this mask. Error and hangup are always
    /// reported so a dead peer wakes both directions.
    pub(crate) fn epoll_flags(self) -> u32 {
        let mut flags = EPOLLET | EPOLLERR | EPOLLHUP;

        if self.contains(Event::Read) {
            flags |= EPOLLIN;
        }
        if self.contains(Event::Write) {
            flags |= EPOLLOUT;
        }

        flags as u32
    }

    /// Events reported ready by an epoll flag word.
    pub(crate) fn from_ready(flags: u32) -> Self {
        let flags = flags as i32;

        if flags & (EPOLLERR | EPOLLHUP) != 0 {
            return Self::BOTH;
        }

        let mut mask = Self::NONE;
        if flags & EPOLLIN != 0 {
            mask = mask | Self::READ;
        }
        if flags & EPOLLOUT != 0 {
            mask = mask | Self::WRITE;
        }

        mask
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitAnd for EventMask {
    type Output = Self;

    fn bitand(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }
}

impl From<Event> for EventMask {
    fn from(event: Event) -> Self {
        event.mask()
    }
}

/// Puts a descriptor in non-blocking mode.
///
/// Edge-triggered readiness only works with descriptors that never block: a
/// reader must drain until `EAGAIN` before waiting again.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
