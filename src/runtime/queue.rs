//! Thread-safe task queue with optional thread affinity.
//!
//! Entries are kept in FIFO order. A worker takes the first entry that is
//! either unbound or bound to its own thread, skipping the rest, so an entry
//! pinned to a busy (or nonexistent) thread can sit at the head while unbound
//! entries behind it are served.

use crate::task::Task;

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

/// A queued task and the thread it is bound to, if any.
pub(crate) struct Entry {
    pub(crate) task: Task,
    pub(crate) affinity: Option<ThreadId>,
}

impl Entry {
    pub(crate) fn new(task: Task, affinity: Option<ThreadId>) -> Self {
        Self { task, affinity }
    }

    fn runnable_on(&self, thread: ThreadId) -> bool {
        self.affinity.is_none_or(|bound| bound == thread)
    }
}

/// FIFO queue of entries plus the condition variable idle workers sleep on.
pub(crate) struct TaskQueue {
    entries: Mutex<VecDeque<Entry>>,
    ready: Condvar,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Appends an entry and reports whether the queue was empty before.
    pub(crate) fn push(&self, entry: Entry) -> bool {
        let mut entries = self.entries.lock();
        let was_empty = entries.is_empty();
        entries.push_back(entry);

        was_empty
    }

    /// Appends every entry under one lock acquisition.
    pub(crate) fn push_batch<I>(&self, batch: I) -> bool
    where
        I: IntoIterator<Item = Entry>,
    {
        let mut entries = self.entries.lock();
        let was_empty = entries.is_empty();
        entries.extend(batch);

        was_empty
    }

    /// Removes the first entry runnable on `thread`.
    pub(crate) fn take_for(&self, thread: ThreadId) -> Option<Entry> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|entry| entry.runnable_on(thread))?;

        entries.remove(index)
    }

    /// Whether some entry could be taken by `thread`.
    pub(crate) fn has_work_for(&self, thread: ThreadId) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|entry| entry.runnable_on(thread))
    }

    /// Blocks until an entry runnable on `thread` exists or `stopping` is set.
    pub(crate) fn wait_for_work(&self, thread: ThreadId, stopping: &AtomicBool) {
        let mut entries = self.entries.lock();

        while !stopping.load(Ordering::SeqCst)
            && !entries.iter().any(|entry| entry.runnable_on(thread))
        {
            self.ready.wait(&mut entries);
        }
    }

    pub(crate) fn notify_one(&self) {
        self.ready.notify_one();
    }

    /// Wakes every sleeper. Taking the lock first makes sure a worker that
    /// already checked the stopping flag is actually waiting.
    pub(crate) fn notify_all(&self) {
        let _entries = self.entries.lock();
        self.ready.notify_all();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drops every queued entry and returns how many there were.
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<Entry> = self.entries.lock().drain(..).collect();
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn callback_entry(affinity: Option<ThreadId>) -> Entry {
        Entry::new(Task::callback(|| {}), affinity)
    }

    #[test]
    fn push_reports_previous_emptiness() {
        let queue = TaskQueue::new();

        assert!(queue.push(callback_entry(None)));
        assert!(!queue.push(callback_entry(None)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn take_skips_entries_bound_elsewhere() {
        let queue = TaskQueue::new();
        let other = thread::spawn(|| thread::current().id())
            .join()
            .unwrap();
        let me = thread::current().id();

        queue.push(callback_entry(Some(other)));
        queue.push(callback_entry(None));
        queue.push(callback_entry(Some(me)));

        let first = queue.take_for(me).unwrap();
        assert!(first.affinity.is_none());

        let second = queue.take_for(me).unwrap();
        assert_eq!(second.affinity, Some(me));

        assert!(queue.take_for(me).is_none());
        assert!(!queue.has_work_for(me));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn clear_returns_dropped_count() {
        let queue = TaskQueue::new();
        queue.push_batch((0..3).map(|_| callback_entry(None)));

        assert_eq!(queue.clear(), 3);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn wait_returns_once_stopping() {
        let queue = TaskQueue::new();
        let stopping = AtomicBool::new(true);

        queue.wait_for_work(thread::current().id(), &stopping);
    }
}
