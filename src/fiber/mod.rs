//! Stackful, cooperatively scheduled coroutines.
//!
//! A [`Fiber`] owns a dedicated stack and a saved execution context. Control
//! moves into a fiber with [`Fiber::resume`] and back out with
//! [`Fiber::suspend`], [`Fiber::yield_to_ready`] or [`Fiber::yield_to_hold`].
//! Every OS thread that touches the runtime gets a *main fiber* representing
//! its native context; suspending a fiber always returns to that main fiber.
//! The main fiber sits in `Hold` while one of its children runs, so exactly
//! one fiber per thread is `Exec`.
//!
//! # State machine
//!
//! ```text
//! Init --resume--> Exec --yield_to_ready--> Ready --resume--> Exec
//!      --yield_to_hold--> Hold --resume--> Exec --body returns--> Term
//! ```
//!
//! Only `Init` and `Term` fibers may be [`reset`](Fiber::reset).
//!
//! # Example
//!
//! ```ignore
//! use spindle::{Fiber, FiberState};
//!
//! let fiber = Fiber::new(|| {
//!     Fiber::yield_to_hold().unwrap();
//! })?;
//!
//! fiber.resume()?;
//! assert_eq!(fiber.state(), FiberState::Hold);
//! fiber.resume()?;
//! assert_eq!(fiber.state(), FiberState::Term);
//! ```
//!
//! Values living on the stack of a fiber that is dropped before it reaches
//! `Term` are leaked, not dropped.

mod context;
mod stack;

use crate::config;
use crate::error::{Error, Result};

use context::Context;
use parking_lot::Mutex;
use stack::Stack;

use std::any::Any;
use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::hint;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use tracing::{debug, trace};

thread_local! {
    /// Fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Fiber representing this thread's native context.
    static MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// Fibers ever created in this process, main fibers included.
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

type Body = Box<dyn FnOnce() + Send + 'static>;

/// Execution state of a fiber.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberState {
    /// Created or reset, never run.
    Init = 0,
    /// Gave up the CPU and wants to run again as soon as possible.
    Ready = 1,
    /// Currently executing on some thread.
    Exec = 2,
    /// Parked until something explicitly resumes it.
    Hold = 3,
    /// Body finished (normally or by panicking).
    Term = 4,
}

impl FiberState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            _ => FiberState::Term,
        }
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiberState::Init => "INIT",
            FiberState::Ready => "READY",
            FiberState::Exec => "EXEC",
            FiberState::Hold => "HOLD",
            FiberState::Term => "TERM",
        };
        f.write_str(name)
    }
}

/// A stackful coroutine.
///
/// Fibers are always handled through `Arc<Fiber>`: the task queue, fd
/// registrations and user code may all hold one, and the stack is released
/// when the last holder drops it.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// Set while some thread is switched into this fiber's context, cleared by
    /// the resumer once the fiber has switched back out.
    on_cpu: AtomicBool,
    context: UnsafeCell<Context>,
    stack: Option<Stack>,
    body: Mutex<Option<Body>>,
    panic: Mutex<Option<String>>,
}

// The context is only touched by the thread that holds `on_cpu`; state, body
// and panic slot are atomics or mutex-protected.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber with the configured default stack size.
    ///
    /// The fiber starts in [`FiberState::Init`] and runs `body` on its first
    /// [`resume`](Fiber::resume).
    ///
    /// # Errors
    /// [`Error::StackAllocation`] if the stack cannot be mapped.
    pub fn new<F>(body: F) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(body, 0)
    }

    /// Creates a fiber with an explicit stack size in bytes.
    ///
    /// A size of zero selects the configured default (128 KiB unless changed
    /// through [`config::set_global`]).
    pub fn with_stack_size<F>(body: F, stack_size: usize) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            config::default_fiber_stack_size()
        } else {
            stack_size
        };

        let stack = Stack::allocate(size)?;
        let fiber = Arc::new(Fiber {
            id: next_id(),
            state: AtomicU8::new(FiberState::Init as u8),
            on_cpu: AtomicBool::new(false),
            context: UnsafeCell::new(Context::empty()),
            stack: Some(stack),
            body: Mutex::new(Some(Box::new(body))),
            panic: Mutex::new(None),
        });

        fiber.prepare_context()?;
        trace!(fiber = fiber.id, stack_size = fiber.stack_size(), "fiber created");

        Ok(fiber)
    }

    fn new_main() -> Arc<Fiber> {
        let fiber = Arc::new(Fiber {
            id: next_id(),
            state: AtomicU8::new(FiberState::Exec as u8),
            on_cpu: AtomicBool::new(true),
            context: UnsafeCell::new(Context::empty()),
            stack: None,
            body: Mutex::new(None),
            panic: Mutex::new(None),
        });

        trace!(fiber = fiber.id, "main fiber created");
        fiber
    }

    /// Rebinds the body and rewinds the context over the same stack.
    ///
    /// # Errors
    /// - [`Error::MainFiber`] for a thread's main fiber.
    /// - [`Error::InvalidState`] unless the fiber is `Init` or `Term`.
    pub fn reset<F>(&self, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.stack.is_none() {
            return Err(Error::MainFiber);
        }

        let state = self.state();
        if !matches!(state, FiberState::Init | FiberState::Term) {
            return Err(Error::InvalidState { id: self.id, state });
        }

        // A terminated fiber may still be switching off its stack.
        self.acquire_cpu();

        let state = self.state();
        let result = if matches!(state, FiberState::Init | FiberState::Term) {
            *self.body.lock() = Some(Box::new(body));
            self.panic.lock().take();
            self.prepare_context().map(|()| {
                self.state.store(FiberState::Init as u8, Ordering::Release);
            })
        } else {
            Err(Error::InvalidState { id: self.id, state })
        };

        self.on_cpu.store(false, Ordering::Release);
        result
    }

    /// Switches the calling thread into this fiber.
    ///
    /// Returns once the fiber suspends or terminates, with the state it
    /// switched out in. That value is read before the fiber can be claimed by
    /// anyone else, unlike a later [`state`](Fiber::state) call: a fiber woken
    /// while still switching out may already be running on another thread.
    /// `Exec` is returned when that other thread claimed it first.
    ///
    /// Resuming the fiber that is already current is a no-op returning
    /// `Exec`. If the fiber is still switching out on another thread, this
    /// waits for it to finish doing so.
    ///
    /// While the fiber runs, the calling thread's main fiber is `Hold`.
    ///
    /// # Errors
    /// - [`Error::InvalidState`] for a terminated fiber or another thread's
    ///   main fiber.
    /// - [`Error::InvalidArgument`] when called from inside a non-main fiber;
    ///   suspension always returns to the main fiber, so nesting is refused.
    pub fn resume(self: &Arc<Self>) -> Result<FiberState> {
        let previous = Fiber::current();

        if Arc::ptr_eq(&previous, self) {
            return Ok(FiberState::Exec);
        }

        if self.is_main() {
            return Err(Error::InvalidState {
                id: self.id,
                state: self.state(),
            });
        }

        if !previous.is_main() {
            return Err(Error::InvalidArgument(
                "fibers can only be resumed from a thread's main fiber",
            ));
        }

        let prior = self.claim()?;
        self.acquire_cpu();

        CURRENT.with(|current| *current.borrow_mut() = Some(self.clone()));
        previous.state.store(FiberState::Hold as u8, Ordering::Release);
        trace!(from = previous.id, to = self.id, "switch in");

        // SAFETY: both contexts live inside Arc allocations that `previous`
        // and the caller's `self` keep alive until the switch returns.
        let switched = unsafe { Context::switch(previous.context.get(), self.context.get()) };

        previous.state.store(FiberState::Exec as u8, Ordering::Release);

        if let Err(err) = switched {
            CURRENT.with(|current| *current.borrow_mut() = Some(previous));
            self.state.store(prior as u8, Ordering::Release);
            self.on_cpu.store(false, Ordering::Release);
            return Err(Error::Facility(err));
        }

        // Nobody can run the fiber past a claim until `on_cpu` is released.
        let state = self.state();
        self.on_cpu.store(false, Ordering::Release);

        Ok(state)
    }

    /// Switches from this fiber back to the thread's main fiber.
    ///
    /// The state becomes `Hold` only if it is still `Exec`, so a state set
    /// just before (for example `Ready`) is preserved.
    ///
    /// # Errors
    /// - [`Error::MainFiber`] when called on a main fiber.
    /// - [`Error::InvalidState`] when this fiber is not the one running on the
    ///   calling thread.
    pub fn suspend(&self) -> Result<()> {
        if self.is_main() {
            return Err(Error::MainFiber);
        }

        let is_current = CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|fiber| ptr::eq(Arc::as_ptr(fiber), self))
        });

        if !is_current {
            return Err(Error::InvalidState {
                id: self.id,
                state: self.state(),
            });
        }

        let _ = self.state.compare_exchange(
            FiberState::Exec as u8,
            FiberState::Hold as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        self.switch_to_main()
    }

    /// Marks the current fiber `Ready` and suspends it.
    pub fn yield_to_ready() -> Result<()> {
        Self::yield_with(FiberState::Ready)
    }

    /// Marks the current fiber `Hold` and suspends it.
    pub fn yield_to_hold() -> Result<()> {
        Self::yield_with(FiberState::Hold)
    }

    fn yield_with(state: FiberState) -> Result<()> {
        let current = Fiber::current();
        if current.is_main() {
            return Err(Error::MainFiber);
        }

        current.state.store(state as u8, Ordering::Release);

        // The resumer keeps a strong reference for as long as this fiber runs,
        // so no Arc needs to live on this stack across the switch.
        let fiber = Arc::as_ptr(&current);
        drop(current);

        unsafe { (*fiber).switch_to_main() }
    }

    /// Returns the fiber executing on the calling thread.
    ///
    /// Creates the thread's main fiber on first use.
    pub fn current() -> Arc<Fiber> {
        CURRENT.with(|current| {
            let existing = current.borrow().clone();
            if let Some(fiber) = existing {
                return fiber;
            }

            let main = Fiber::new_main();
            MAIN.with(|slot| *slot.borrow_mut() = Some(main.clone()));
            *current.borrow_mut() = Some(main.clone());
            main
        })
    }

    /// Number of fibers created in this process so far, main fibers included.
    pub fn total_count() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    /// Unique id of this fiber.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether this is a thread's main fiber (it owns no stack).
    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }

    /// Usable stack size in bytes, zero for a main fiber.
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::size)
    }

    /// Whether the last run of the body ended in a panic.
    pub fn panicked(&self) -> bool {
        self.panic.lock().is_some()
    }

    /// Panic message recorded when the body last panicked.
    pub fn panic_message(&self) -> Option<String> {
        self.panic.lock().clone()
    }

    /// Takes the panic message recorded when the body last panicked.
    pub fn take_panic(&self) -> Option<String> {
        self.panic.lock().take()
    }

    fn prepare_context(&self) -> Result<()> {
        let stack = self.stack.as_ref().ok_or(Error::MainFiber)?;

        // SAFETY: callers guarantee the fiber is not running, and the stack
        // lives as long as the fiber.
        unsafe { (*self.context.get()).prepare(stack, fiber_entry) }.map_err(Error::Facility)
    }

    /// Moves the state to `Exec`, returning the state it replaced.
    fn claim(&self) -> Result<FiberState> {
        loop {
            let state = self.state();
            match state {
                FiberState::Init | FiberState::Ready | FiberState::Hold => {
                    if self
                        .state
                        .compare_exchange(
                            state as u8,
                            FiberState::Exec as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return Ok(state);
                    }
                }
                // Still running elsewhere, typically between registering
                // itself for a wakeup and actually yielding.
                FiberState::Exec => hint::spin_loop(),
                FiberState::Term => {
                    return Err(Error::InvalidState { id: self.id, state });
                }
            }
        }
    }

    fn acquire_cpu(&self) {
        while self
            .on_cpu
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
    }

    fn switch_to_main(&self) -> Result<()> {
        let main = MAIN
            .with(|main| main.borrow().clone())
            .ok_or(Error::InvalidArgument("no main fiber to switch back to"))?;

        let target = main.context.get();

        // Drop our own handle before leaving: the resumer still owns one, and a
        // reference parked on this stack would never be released if the fiber
        // is abandoned.
        let own = CURRENT.with(|current| current.borrow_mut().replace(main));
        drop(own);

        trace!(fiber = self.id, state = %self.state(), "switch out");

        // SAFETY: the main fiber is pinned by the MAIN thread-local and this
        // fiber by its resumer.
        unsafe { Context::switch(self.context.get(), target) }.map_err(Error::Facility)
    }

    fn run_body(&self) {
        let body = self.body.lock().take();

        if let Some(body) = body
            && let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body))
        {
            let message = panic_message(payload.as_ref());
            debug!(fiber = self.id, %message, "fiber body panicked");
            *self.panic.lock() = Some(message);
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("main", &self.is_main())
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        trace!(fiber = self.id, state = %self.state(), "fiber dropped");
    }
}

/// Entry point of every fiber context.
extern "C" fn fiber_entry() {
    let fiber = CURRENT.with(|current| current.borrow().as_ref().map(Arc::as_ptr));

    let Some(fiber) = fiber else {
        std::process::abort();
    };

    // SAFETY: the resumer holds a strong reference until this fiber switches
    // out for the last time.
    let fiber = unsafe { &*fiber };

    fiber.run_body();
    fiber.state.store(FiberState::Term as u8, Ordering::Release);

    // Returning would end the thread (uc_link is null); a failed switch leaves
    // nowhere to go.
    let _ = fiber.switch_to_main();
    std::process::abort();
}

fn next_id() -> u64 {
    FIBER_COUNT.fetch_add(1, Ordering::Relaxed) + 1
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
