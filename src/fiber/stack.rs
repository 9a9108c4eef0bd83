use crate::error::{Error, Result};

use libc::{
    MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE, mmap, mprotect,
    munmap,
};
use std::ptr;
use std::sync::OnceLock;

/// Smallest stack handed out, whatever the caller asked for.
const MIN_STACK_SIZE: usize = 16 * 1024;

/// Fixed-size fiber stack backed by an anonymous mapping.
///
/// The lowest page is mapped `PROT_NONE` so an overflow faults instead of
/// silently corrupting the neighbouring allocation.
pub(crate) struct Stack {
    mapping: *mut u8,
    total: usize,
    guard: usize,
}

// The mapping is plain memory owned exclusively by this value.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    pub(crate) fn allocate(size: usize) -> Result<Self> {
        let page = page_size();
        let total = size
            .max(MIN_STACK_SIZE)
            .checked_next_multiple_of(page)
            .and_then(|usable| usable.checked_add(page))
            .ok_or(Error::StackAllocation { size })?;

        let mapping = unsafe {
            mmap(
                ptr::null_mut(),
                total,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if mapping == MAP_FAILED {
            return Err(Error::StackAllocation { size });
        }

        if unsafe { mprotect(mapping, page, PROT_NONE) } != 0 {
            unsafe { munmap(mapping, total) };
            return Err(Error::StackAllocation { size });
        }

        Ok(Self {
            mapping: mapping as *mut u8,
            total,
            guard: page,
        })
    }

    /// Lowest usable address (just above the guard page).
    pub(crate) fn base(&self) -> *mut u8 {
        unsafe { self.mapping.add(self.guard) }
    }

    /// Usable size in bytes.
    pub(crate) fn size(&self) -> usize {
        self.total - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            munmap(self.mapping as *mut libc::c_void, self.total);
        }
    }
}

fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();

    *PAGE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 { 4096 } else { size as usize }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_round_up_to_whole_pages() {
        let page = page_size();
        let stack = Stack::allocate(MIN_STACK_SIZE + 1).unwrap();

        assert_eq!(stack.size() % page, 0);
        assert!(stack.size() > MIN_STACK_SIZE);
    }

    #[test]
    fn tiny_requests_get_the_minimum() {
        let stack = Stack::allocate(0).unwrap();

        assert_eq!(stack.size(), MIN_STACK_SIZE.next_multiple_of(page_size()));
    }

    #[test]
    fn oversized_requests_fail_cleanly() {
        assert!(matches!(
            Stack::allocate(usize::MAX),
            Err(Error::StackAllocation { size: usize::MAX })
        ));
        assert!(matches!(
            Stack::allocate(usize::MAX - page_size()),
            Err(Error::StackAllocation { .. })
        ));
    }
}
