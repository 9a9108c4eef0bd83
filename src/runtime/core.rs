//! Multi-threaded fiber scheduler.
//!
//! A [`Scheduler`] owns a fixed pool of worker threads sharing one FIFO task
//! queue. Each worker repeatedly takes the first task it may run (unbound, or
//! bound to its own thread), resumes it inside a fiber, and parks in the
//! scheduler's driver when nothing is runnable.
//!
//! Work is submitted through the scheduler itself or through a cloned
//! [`Handle`], which is also what code running on a worker gets back from
//! [`Scheduler::current`].
//!
//! # Example
//!
//! ```ignore
//! use spindle::Scheduler;
//!
//! let scheduler = Scheduler::new(4, false, "pool");
//! scheduler.start()?;
//!
//! scheduler.spawn(|| {
//!     let handle = Scheduler::current().unwrap();
//!     handle.spawn(|| println!("nested"));
//! });
//!
//! scheduler.stop();
//! ```

use crate::builder::SchedulerBuilder;
use crate::config::{RuntimeConfig, SchedulerConfig};
use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberState};
use crate::runtime::context::{current_handle, enter_context};
use crate::runtime::driver::{CondvarDriver, Driver};
use crate::runtime::queue::{Entry, TaskQueue};
use crate::task::{Callback, Task};

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, info, warn};

/// State shared by the scheduler, its workers and every handle.
pub(crate) struct Shared {
    name: String,
    threads: usize,
    use_caller: bool,
    stack_size: usize,
    queue: TaskQueue,
    driver: Arc<dyn Driver>,
    running: AtomicBool,
    stopping: AtomicBool,
    active: AtomicUsize,
    idle: AtomicUsize,
    worker_ids: Mutex<Vec<ThreadId>>,
}

impl Shared {
    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub(crate) fn stopping_flag(&self) -> &AtomicBool {
        &self.stopping
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Total number of workers, the caller included when it joins the pool.
    pub(crate) fn thread_count(&self) -> usize {
        self.threads
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn submit(&self, task: Task, affinity: Option<ThreadId>) {
        let was_empty = self.queue.push(Entry::new(task, affinity));
        self.notify(was_empty, affinity.is_some());
    }

    pub(crate) fn submit_batch<I>(&self, tasks: I, affinity: Option<ThreadId>)
    where
        I: IntoIterator<Item = Task>,
    {
        let entries: Vec<Entry> = tasks
            .into_iter()
            .map(|task| Entry::new(task, affinity))
            .collect();

        if entries.is_empty() {
            return;
        }

        let was_empty = self.queue.push_batch(entries);
        self.notify(was_empty, affinity.is_some());
    }

    /// Wakes parked workers after a push, outside the queue lock.
    ///
    /// A non-empty queue can still look empty to parked workers when its head
    /// is bound to another thread, so idle workers are woken either way.
    fn notify(&self, was_empty: bool, bound: bool) {
        if !was_empty && self.idle.load(Ordering::SeqCst) == 0 {
            return;
        }

        if bound {
            self.driver.wake_all(self);
        } else {
            self.driver.tickle(self);
        }
    }

    /// Worker loop, run by every pool thread and by the caller in `run`.
    fn run_worker(self: &Arc<Self>) {
        let me = thread::current().id();
        debug!(scheduler = %self.name, thread = ?me, "worker started");

        let handle = Handle {
            shared: Arc::clone(self),
        };

        enter_context(handle, || {
            // Terminated callback fiber kept around for the next callback.
            let mut spare: Option<Arc<Fiber>> = None;

            while !self.is_stopping() {
                if let Some(entry) = self.queue.take_for(me) {
                    self.active.fetch_add(1, Ordering::SeqCst);
                    self.execute(entry, &mut spare);
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }

                self.idle.fetch_add(1, Ordering::SeqCst);
                self.driver.park(self);
                self.idle.fetch_sub(1, Ordering::SeqCst);
            }
        });

        debug!(scheduler = %self.name, thread = ?me, "worker exited");
    }

    fn execute(&self, entry: Entry, spare: &mut Option<Arc<Fiber>>) {
        let Entry { task, affinity } = entry;

        let fiber = match task {
            Task::Fiber(fiber) => fiber,
            Task::Callback(callback) => match self.wrap_callback(callback, spare) {
                Ok(fiber) => fiber,
                Err(err) => {
                    error!(scheduler = %self.name, %err, "could not create a fiber for a callback");
                    return;
                }
            },
        };

        // The state seen at switch-out, not a fresh read: a woken fiber may
        // already be running on another worker.
        let state = match fiber.resume() {
            Ok(state) => state,
            Err(err) => {
                warn!(scheduler = %self.name, fiber = fiber.id(), %err, "task refused to resume");
                return;
            }
        };

        match state {
            FiberState::Ready => self.submit(Task::Fiber(fiber), affinity),
            FiberState::Term => {
                if let Some(message) = fiber.panic_message() {
                    warn!(scheduler = %self.name, fiber = fiber.id(), %message, "task panicked");
                }
                if Arc::strong_count(&fiber) == 1 {
                    *spare = Some(fiber);
                }
            }
            // Hold: whoever parked the fiber keeps it alive.
            _ => {}
        }
    }

    fn wrap_callback(&self, callback: Callback, spare: &mut Option<Arc<Fiber>>) -> Result<Arc<Fiber>> {
        if let Some(fiber) = spare.take() {
            fiber.reset(callback)?;
            return Ok(fiber);
        }

        Fiber::with_stack_size(callback, self.stack_size)
    }
}

/// Cheap clonable handle to a scheduler.
///
/// Handles can submit work and read counters, but never start or stop the
/// pool. They stay valid after the scheduler stops; work submitted then is
/// simply never run.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Queues a task, optionally bound to one worker thread.
    pub fn submit(&self, task: Task, affinity: Option<ThreadId>) {
        self.shared.submit(task, affinity);
    }

    /// Queues several tasks under one lock acquisition, waking at most once.
    pub fn submit_batch<I>(&self, tasks: I, affinity: Option<ThreadId>)
    where
        I: IntoIterator<Item = Task>,
    {
        self.shared.submit_batch(tasks, affinity);
    }

    /// Queues an unbound callback.
    pub fn spawn<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit(Task::callback(callback), None);
    }

    /// Workers currently parked in the driver.
    pub fn idle_count(&self) -> usize {
        self.shared.idle.load(Ordering::SeqCst)
    }

    /// Workers currently executing a task.
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Tasks waiting in the queue.
    pub fn task_count(&self) -> usize {
        self.shared.queue.len()
    }

    /// Name of the scheduler.
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Whether stop has been requested.
    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn driver(&self) -> Arc<dyn Driver> {
        Arc::clone(&self.shared.driver)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.shared.name)
            .field("tasks", &self.task_count())
            .finish()
    }
}

/// A pool of worker threads executing tasks inside fibers.
///
/// Dropping the scheduler stops it.
pub struct Scheduler {
    handle: Handle,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates a stopped scheduler with `threads` workers.
    ///
    /// With `use_caller`, one of the workers is the calling thread, which
    /// joins the pool later through [`run`](Scheduler::run); only
    /// `threads - 1` threads are spawned.
    ///
    /// # Example
    /// ```ignore
    /// let scheduler = Scheduler::new(2, false, "workers");
    /// ```
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Self {
        let config = SchedulerConfig {
            threads,
            use_caller,
            name: name.to_string(),
        };

        Self::with_driver(&config, 0, Arc::new(CondvarDriver))
    }

    /// Creates a scheduler from a full runtime configuration.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let config = config.clone().normalized();

        Self::with_driver(&config.scheduler, config.fiber.stack_size, Arc::new(CondvarDriver))
    }

    /// Returns a builder seeded from the global configuration.
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub(crate) fn with_driver(
        config: &SchedulerConfig,
        stack_size: usize,
        driver: Arc<dyn Driver>,
    ) -> Self {
        let shared = Shared {
            name: config.name.clone(),
            threads: config.threads.max(1),
            use_caller: config.use_caller,
            stack_size,
            queue: TaskQueue::new(),
            driver,
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            worker_ids: Mutex::new(Vec::new()),
        };

        debug!(scheduler = %shared.name, threads = shared.threads, "scheduler created");

        Self {
            handle: Handle {
                shared: Arc::new(shared),
            },
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker threads. Calling it on a running scheduler does
    /// nothing.
    ///
    /// Threads are named `"{name}-{index}"`.
    ///
    /// # Errors
    /// [`Error::ThreadSpawn`] if a thread cannot be spawned. Workers spawned
    /// before the failure keep running until [`stop`](Scheduler::stop).
    pub fn start(&self) -> Result<()> {
        let shared = &self.handle.shared;
        let mut workers = self.workers.lock();

        if shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        shared.stopping.store(false, Ordering::SeqCst);

        let mut ids = shared.worker_ids.lock();
        let spawned = if shared.use_caller {
            ids.push(thread::current().id());
            shared.threads - 1
        } else {
            shared.threads
        };

        for index in 0..spawned {
            let worker = Arc::clone(shared);
            let join = thread::Builder::new()
                .name(format!("{}-{}", shared.name, index))
                .spawn(move || worker.run_worker())
                .map_err(Error::ThreadSpawn)?;

            ids.push(join.thread().id());
            workers.push(join);
        }

        info!(
            scheduler = %shared.name,
            threads = shared.threads,
            use_caller = shared.use_caller,
            "scheduler started"
        );

        Ok(())
    }

    /// Stops the pool: wakes every worker, joins the spawned threads and drops
    /// the tasks still queued.
    ///
    /// Never joins the calling thread, so a task may stop its own scheduler.
    /// Idempotent.
    pub fn stop(&self) {
        let shared = &self.handle.shared;

        // Released before joining: a worker may call stop as well.
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();

        shared.stopping.store(true, Ordering::SeqCst);
        shared.driver.wake_all(shared);

        let me = thread::current().id();
        for worker in workers {
            if worker.thread().id() == me {
                continue;
            }

            if worker.join().is_err() {
                error!(scheduler = %shared.name, "worker thread panicked");
            }
        }

        shared.worker_ids.lock().clear();

        let dropped = shared.queue.clear();
        if dropped > 0 {
            debug!(scheduler = %shared.name, dropped, "discarded queued tasks");
        }

        if shared.running.swap(false, Ordering::SeqCst) {
            info!(scheduler = %shared.name, "scheduler stopped");
        }
    }

    /// Runs the worker loop on the calling thread until the scheduler stops.
    ///
    /// This is how the caller joins the pool when `use_caller` is set.
    pub fn run(&self) {
        self.handle.shared.run_worker();
    }

    /// Handle to the scheduler driving the calling worker thread.
    pub fn current() -> Option<Handle> {
        current_handle()
    }

    /// A clonable handle to this scheduler.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Queues a task, optionally bound to one worker thread.
    ///
    /// # Arguments
    /// * `task` - Fiber or callback to run
    /// * `affinity` - Thread that must run it, or `None` for any worker
    pub fn submit(&self, task: Task, affinity: Option<ThreadId>) {
        self.handle.submit(task, affinity);
    }

    /// Queues several tasks, waking at most one worker.
    pub fn submit_batch<I>(&self, tasks: I, affinity: Option<ThreadId>)
    where
        I: IntoIterator<Item = Task>,
    {
        self.handle.submit_batch(tasks, affinity);
    }

    /// Queues an unbound callback.
    pub fn spawn<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(callback);
    }

    /// Workers currently parked in the driver.
    pub fn idle_count(&self) -> usize {
        self.handle.idle_count()
    }

    /// Workers currently executing a task.
    pub fn active_count(&self) -> usize {
        self.handle.active_count()
    }

    /// Tasks waiting in the queue, including ones bound to threads that never
    /// serve this scheduler.
    pub fn task_count(&self) -> usize {
        self.handle.task_count()
    }

    /// Ids of the threads serving this scheduler, the caller included when
    /// `use_caller` is set. Empty while stopped.
    pub fn worker_ids(&self) -> Vec<ThreadId> {
        self.handle.shared.worker_ids.lock().clone()
    }

    /// Name given at construction, also the prefix of the worker thread names.
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Whether the scheduler was started and not yet stopped.
    pub fn is_running(&self) -> bool {
        let shared = &self.handle.shared;
        shared.running.load(Ordering::SeqCst) && !shared.is_stopping()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name())
            .field("threads", &self.handle.shared.threads)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
