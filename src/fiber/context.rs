//! Saved execution context of a fiber.
//!
//! Thin wrapper over `ucontext_t`. A `Context` must stay at a fixed address
//! once `prepare` or `switch` has written to it: glibc stores a pointer to the
//! embedded floating point area inside the structure itself. Fibers keep their
//! context inside the `Arc<Fiber>` allocation for that reason.

use crate::fiber::stack::Stack;

use libc::{getcontext, makecontext, swapcontext, ucontext_t};
use std::io;
use std::mem::MaybeUninit;
use std::ptr;

pub(crate) struct Context {
    inner: ucontext_t,
}

impl Context {
    pub(crate) fn empty() -> Self {
        // An all-zero ucontext_t is a valid "nothing saved yet" value; it is
        // only ever read after getcontext or swapcontext filled it in.
        Self {
            inner: unsafe { MaybeUninit::zeroed().assume_init() },
        }
    }

    /// Arranges for the next switch into this context to call `entry` on `stack`.
    ///
    /// # Safety
    /// The context must not be running, and `stack` must outlive every switch
    /// into this context.
    pub(crate) unsafe fn prepare(&mut self, stack: &Stack, entry: extern "C" fn()) -> io::Result<()> {
        if unsafe { getcontext(&mut self.inner) } != 0 {
            return Err(io::Error::last_os_error());
        }

        self.inner.uc_stack.ss_sp = stack.base() as *mut libc::c_void;
        self.inner.uc_stack.ss_size = stack.size();
        self.inner.uc_stack.ss_flags = 0;
        self.inner.uc_link = ptr::null_mut();

        unsafe { makecontext(&mut self.inner, entry, 0) };

        Ok(())
    }

    /// Saves the running context into `from` and resumes `to`.
    ///
    /// Returns once something switches back into `from`.
    ///
    /// # Safety
    /// Both pointers must reference live contexts that do not move while the
    /// switch is in progress, and `to` must have been prepared or saved.
    pub(crate) unsafe fn switch(from: *mut Context, to: *const Context) -> io::Result<()> {
        let ret = unsafe { swapcontext(&raw mut (*from).inner, &raw const (*to).inner) };

        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}
