use spindle::{Error, Fiber, FiberState};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::thread;

#[test]
fn test_resume_then_suspend_leaves_hold() {
    let fiber = Fiber::new(|| {
        let me = Fiber::current();
        me.suspend().unwrap();
    })
    .unwrap();

    assert_eq!(fiber.state(), FiberState::Init);

    fiber.resume().unwrap();
    assert_eq!(fiber.state(), FiberState::Hold);

    fiber.resume().unwrap();
    assert_eq!(fiber.state(), FiberState::Term);
}

#[test]
fn test_ready_hold_term_sequence() {
    let fiber = Fiber::new(|| {
        Fiber::yield_to_ready().unwrap();
        Fiber::yield_to_hold().unwrap();
    })
    .unwrap();

    fiber.resume().unwrap();
    assert_eq!(fiber.state(), FiberState::Ready);

    fiber.resume().unwrap();
    assert_eq!(fiber.state(), FiberState::Hold);

    fiber.resume().unwrap();
    assert_eq!(fiber.state(), FiberState::Term);
}

#[test]
fn test_body_runs_between_switches() {
    let steps = Arc::new(Mutex::new(Vec::new()));
    let inner = steps.clone();

    let fiber = Fiber::new(move || {
        inner.lock().unwrap().push("first");
        Fiber::yield_to_hold().unwrap();
        inner.lock().unwrap().push("second");
    })
    .unwrap();

    steps.lock().unwrap().push("before");
    fiber.resume().unwrap();
    steps.lock().unwrap().push("between");
    fiber.resume().unwrap();

    assert_eq!(
        *steps.lock().unwrap(),
        vec!["before", "first", "between", "second"]
    );
}

#[test]
fn test_reset_after_term_runs_new_body() {
    let counter = Arc::new(AtomicUsize::new(0));

    let first = counter.clone();
    let fiber = Fiber::new(move || {
        first.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    fiber.resume().unwrap();
    assert_eq!(fiber.state(), FiberState::Term);

    let second = counter.clone();
    fiber
        .reset(move || {
            second.fetch_add(10, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(fiber.state(), FiberState::Init);

    fiber.resume().unwrap();
    assert_eq!(fiber.state(), FiberState::Term);
    assert_eq!(counter.load(Ordering::SeqCst), 11);
}

#[test]
fn test_reset_while_running_fails() {
    let refused = Arc::new(AtomicBool::new(false));
    let flag = refused.clone();

    let fiber = Fiber::new(move || {
        let me = Fiber::current();
        let result = me.reset(|| {});
        flag.store(
            matches!(result, Err(Error::InvalidState { state: FiberState::Exec, .. })),
            Ordering::SeqCst,
        );
    })
    .unwrap();

    fiber.resume().unwrap();

    assert!(refused.load(Ordering::SeqCst));
    assert_eq!(fiber.state(), FiberState::Term);
}

#[test]
fn test_reset_while_held_fails() {
    let fiber = Fiber::new(|| {
        Fiber::yield_to_hold().unwrap();
    })
    .unwrap();

    fiber.resume().unwrap();

    assert!(matches!(
        fiber.reset(|| {}),
        Err(Error::InvalidState { state: FiberState::Hold, .. })
    ));

    fiber.resume().unwrap();
}

#[test]
fn test_main_fiber_cannot_be_reset() {
    let main = Fiber::current();

    assert!(main.is_main());
    assert_eq!(main.state(), FiberState::Exec);
    assert_eq!(main.stack_size(), 0);
    assert!(matches!(main.reset(|| {}), Err(Error::MainFiber)));
}

#[test]
fn test_yield_outside_fiber_fails() {
    assert!(matches!(Fiber::yield_to_ready(), Err(Error::MainFiber)));
    assert!(matches!(Fiber::yield_to_hold(), Err(Error::MainFiber)));
    assert!(matches!(Fiber::current().suspend(), Err(Error::MainFiber)));
}

#[test]
fn test_resume_terminated_fiber_fails() {
    let fiber = Fiber::new(|| {}).unwrap();
    fiber.resume().unwrap();

    assert!(matches!(
        fiber.resume(),
        Err(Error::InvalidState { state: FiberState::Term, .. })
    ));
}

#[test]
fn test_nested_resume_is_refused() {
    let refused = Arc::new(AtomicBool::new(false));
    let flag = refused.clone();

    let inner = Fiber::new(|| {}).unwrap();
    let target = inner.clone();

    let outer = Fiber::new(move || {
        let result = target.resume();
        flag.store(matches!(result, Err(Error::InvalidArgument(_))), Ordering::SeqCst);
    })
    .unwrap();

    outer.resume().unwrap();

    assert!(refused.load(Ordering::SeqCst));
    assert_eq!(inner.state(), FiberState::Init);
}

#[test]
fn test_panic_is_captured_at_fiber_boundary() {
    let fiber = Fiber::new(|| panic!("boom")).unwrap();

    fiber.resume().unwrap();

    assert_eq!(fiber.state(), FiberState::Term);
    assert!(fiber.panicked());
    assert_eq!(fiber.panic_message().as_deref(), Some("boom"));
    assert_eq!(fiber.take_panic().as_deref(), Some("boom"));
    assert!(!fiber.panicked());
}

#[test]
fn test_held_fiber_resumes_on_another_thread() {
    let fiber = Fiber::new(|| {
        Fiber::yield_to_hold().unwrap();
    })
    .unwrap();

    fiber.resume().unwrap();
    assert_eq!(fiber.state(), FiberState::Hold);

    let moved = fiber.clone();
    thread::spawn(move || moved.resume().unwrap())
        .join()
        .unwrap();

    assert_eq!(fiber.state(), FiberState::Term);
}

#[test]
fn test_ids_and_counts() {
    let before = Fiber::total_count();

    let a = Fiber::new(|| {}).unwrap();
    let b = Fiber::new(|| {}).unwrap();

    assert_ne!(a.id(), b.id());
    assert!(Fiber::total_count() >= before + 2);
}

#[test]
fn test_resume_reports_switch_out_state() {
    let fiber = Fiber::new(|| {
        Fiber::yield_to_ready().unwrap();
        Fiber::yield_to_hold().unwrap();
    })
    .unwrap();

    assert_eq!(fiber.resume().unwrap(), FiberState::Ready);
    assert_eq!(fiber.resume().unwrap(), FiberState::Hold);
    assert_eq!(fiber.resume().unwrap(), FiberState::Term);
}

#[test]
fn test_main_fiber_holds_while_child_runs() {
    let main = Fiber::current();
    let observed = Arc::new(Mutex::new(None));

    let inner_main = main.clone();
    let record = observed.clone();
    let fiber = Fiber::new(move || {
        *record.lock().unwrap() = Some(inner_main.state());
    })
    .unwrap();

    fiber.resume().unwrap();

    assert_eq!(*observed.lock().unwrap(), Some(FiberState::Hold));
    assert_eq!(main.state(), FiberState::Exec);
}

#[test]
fn test_oversized_stack_is_an_error() {
    assert!(matches!(
        Fiber::with_stack_size(|| {}, usize::MAX),
        Err(Error::StackAllocation { .. })
    ));
}

#[test]
fn test_stack_sizes() {
    let small = Fiber::with_stack_size(|| {}, 1).unwrap();
    assert!(small.stack_size() >= 16 * 1024);

    let default = Fiber::new(|| {}).unwrap();
    assert!(default.stack_size() >= spindle::config::DEFAULT_STACK_SIZE);
}
