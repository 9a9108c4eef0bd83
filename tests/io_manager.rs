use spindle::{Error, Event, EventMask, IoManager, Scheduler, Task, set_nonblocking};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
    mpsc,
};
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Pipe {
    read: i32,
    write: i32,
}

impl Pipe {
    fn new() -> Self {
        let mut fds = [0i32; 2];
        let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(res, 0, "pipe() failed");

        set_nonblocking(fds[0]).unwrap();
        set_nonblocking(fds[1]).unwrap();

        Self {
            read: fds[0],
            write: fds[1],
        }
    }

    fn send(&self, byte: u8) {
        let buf = [byte; 1];
        let wrote = unsafe { libc::write(self.write, buf.as_ptr() as *const _, 1) };
        assert_eq!(wrote, 1);
    }

    fn close_write(&mut self) {
        unsafe { libc::close(self.write) };
        self.write = -1;
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            if self.write >= 0 {
                libc::close(self.write);
            }
        }
    }
}

fn counting_task(counter: &Arc<AtomicUsize>, tx: &mpsc::Sender<()>) -> Task {
    let counter = counter.clone();
    let tx = tx.clone();
    Task::callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(());
    })
}

#[test]
fn test_duplicate_registration_is_rejected() {
    let io = IoManager::new(1, false, "dup").unwrap();
    let pipe = Pipe::new();

    io.add_event(pipe.read, Event::Read, Some(Task::callback(|| {})))
        .unwrap();

    let second = io.add_event(pipe.read, Event::Read, Some(Task::callback(|| {})));
    assert!(matches!(
        second,
        Err(Error::AlreadyRegistered { event: Event::Read, .. })
    ));

    assert_eq!(io.registered(pipe.read), EventMask::READ);
    assert_eq!(io.pending_event_count(), 1);

    assert!(io.del_event(pipe.read, Event::Read));
    assert_eq!(io.pending_event_count(), 0);
}

#[test]
fn test_negative_fd_is_rejected() {
    let io = IoManager::new(1, false, "negative").unwrap();

    let result = io.add_event(-1, Event::Read, Some(Task::callback(|| {})));
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[test]
fn test_registering_outside_a_fiber_needs_a_task() {
    let io = IoManager::new(1, false, "nofiber").unwrap();
    let pipe = Pipe::new();

    let result = io.add_event(pipe.read, Event::Read, None);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert_eq!(io.registered(pipe.read), EventMask::NONE);
}

#[test]
fn test_cancel_event_runs_follow_up_once() {
    let io = IoManager::new(1, false, "cancel").unwrap();
    io.start().unwrap();
    let pipe = Pipe::new();

    let counter = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    io.add_event(pipe.read, Event::Read, Some(counting_task(&counter, &tx)))
        .unwrap();

    assert!(io.cancel_event(pipe.read, Event::Read));
    rx.recv_timeout(TIMEOUT).unwrap();

    assert!(!io.cancel_event(pipe.read, Event::Read));
    assert_eq!(io.registered(pipe.read), EventMask::NONE);

    // Readiness after the cancellation must not run it again.
    pipe.send(1);
    thread::sleep(Duration::from_millis(50));

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    io.stop();
}

#[test]
fn test_cancel_all_runs_both_follow_ups() {
    let io = IoManager::new(2, false, "cancelall").unwrap();
    io.start().unwrap();
    let pipe = Pipe::new();

    let counter = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    // An empty pipe's read end is neither readable nor writable.
    io.add_event(pipe.read, Event::Read, Some(counting_task(&counter, &tx)))
        .unwrap();
    io.add_event(pipe.read, Event::Write, Some(counting_task(&counter, &tx)))
        .unwrap();
    assert_eq!(io.registered(pipe.read), EventMask::BOTH);

    assert!(io.cancel_all(pipe.read));
    rx.recv_timeout(TIMEOUT).unwrap();
    rx.recv_timeout(TIMEOUT).unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(io.registered(pipe.read), EventMask::NONE);
    assert_eq!(io.pending_event_count(), 0);
    assert!(!io.cancel_all(pipe.read));

    io.stop();
}

#[test]
fn test_del_event_leaves_nothing_registered() {
    let io = IoManager::new(1, false, "del").unwrap();
    let pipe = Pipe::new();

    io.add_event(pipe.read, Event::Read, Some(Task::callback(|| {})))
        .unwrap();
    io.add_event(pipe.read, Event::Write, Some(Task::callback(|| {})))
        .unwrap();

    assert!(io.del_event(pipe.read, Event::Read));
    assert_eq!(io.registered(pipe.read), EventMask::WRITE);

    assert!(io.del_event(pipe.read, Event::Write));
    assert_eq!(io.registered(pipe.read), EventMask::NONE);
    assert!(!io.del_event(pipe.read, Event::Write));

    // Nothing was queued: deletion never runs the follow-up.
    assert_eq!(io.scheduler().task_count(), 0);

    // The slot is reusable after full removal.
    io.add_event(pipe.read, Event::Read, Some(Task::callback(|| {})))
        .unwrap();
    assert_eq!(io.registered(pipe.read), EventMask::READ);
}

#[test]
fn test_readiness_runs_callback() {
    let io = IoManager::new(2, false, "ready").unwrap();
    io.start().unwrap();
    let pipe = Pipe::new();

    let counter = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    io.add_event(pipe.read, Event::Read, Some(counting_task(&counter, &tx)))
        .unwrap();

    pipe.send(42);
    rx.recv_timeout(TIMEOUT).unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(io.registered(pipe.read), EventMask::NONE);

    io.stop();
}

#[test]
fn test_wait_resumes_fiber_on_readiness() {
    let io = IoManager::new(2, false, "wait").unwrap();
    io.start().unwrap();
    let pipe = Pipe::new();
    let fd = pipe.read;

    let (tx, rx) = mpsc::channel();
    io.scheduler().spawn(move || {
        let io = IoManager::current().unwrap();
        tx.send(None).unwrap();

        io.wait(fd, Event::Read).unwrap();

        let mut buf = [0u8; 1];
        let read = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, 1) };
        assert_eq!(read, 1);
        tx.send(Some(buf[0])).unwrap();
    });

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), None);
    pipe.send(7);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Some(7));

    io.stop();
}

#[test]
fn test_hangup_triggers_both_directions() {
    let io = IoManager::new(1, false, "hangup").unwrap();
    io.start().unwrap();
    let mut pipe = Pipe::new();

    let counter = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    io.add_event(pipe.read, Event::Read, Some(counting_task(&counter, &tx)))
        .unwrap();
    io.add_event(pipe.read, Event::Write, Some(counting_task(&counter, &tx)))
        .unwrap();

    pipe.close_write();

    rx.recv_timeout(TIMEOUT).unwrap();
    rx.recv_timeout(TIMEOUT).unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(io.registered(pipe.read), EventMask::NONE);

    io.stop();
}

#[test]
fn test_current_is_only_set_on_io_workers() {
    assert!(IoManager::current().is_none());

    let scheduler = Scheduler::new(1, false, "plain");
    scheduler.start().unwrap();

    let (tx, rx) = mpsc::channel();
    scheduler.spawn(move || tx.send(IoManager::current().is_some()).unwrap());
    assert!(!rx.recv_timeout(TIMEOUT).unwrap());
    scheduler.stop();

    let io = IoManager::new(1, false, "io").unwrap();
    io.start().unwrap();

    let (tx, rx) = mpsc::channel();
    io.scheduler()
        .spawn(move || tx.send(IoManager::current().is_some()).unwrap());
    assert!(rx.recv_timeout(TIMEOUT).unwrap());
}

#[test]
fn test_plain_tasks_run_on_io_workers() {
    let io = IoManager::new(2, false, "tasks").unwrap();
    io.start().unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    for _ in 0..10 {
        io.scheduler().submit(counting_task(&counter, &tx), None);
    }

    for _ in 0..10 {
        rx.recv_timeout(TIMEOUT).unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), 10);
}
