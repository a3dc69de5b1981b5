//! Interrupt nesting and deferred dispatch.
use rook_port_hosted::{self as port, use_port};

fn noop(_: usize) {}

mod nested_isrs_switch_once {
    use super::*;
    use rook_kernel::{PortToKernel, SchedState, StackStorage, System, ThreadCb};

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 0,
    });

    static THREAD_A: ThreadCb<Sys> = ThreadCb::new();
    static STACK_A: StackStorage<512> = StackStorage::new();
    static THREAD_H1: ThreadCb<Sys> = ThreadCb::new();
    static STACK_H1: StackStorage<512> = StackStorage::new();
    static THREAD_H2: ThreadCb<Sys> = ThreadCb::new();
    static STACK_H2: StackStorage<512> = StackStorage::new();

    #[test]
    fn nested_isrs_switch_once() {
        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::thread_init(&THREAD_A, super::noop, 0, &STACK_A, 5).unwrap();
        port::boot::<Sys>();

        let before = port::dispatch_count::<Sys>();

        // Outer interrupt readies H1; a nested interrupt readies H2.
        unsafe { Sys::isr_enter() };
        System::<Sys>::thread_init(&THREAD_H1, super::noop, 0, &STACK_H1, 10).unwrap();

        unsafe { Sys::isr_enter() };
        assert_eq!(System::<Sys>::sched_snapshot().unwrap().isr_depth, 2);
        System::<Sys>::thread_init(&THREAD_H2, super::noop, 0, &STACK_H2, 12).unwrap();

        // Leaving the inner handler must not dispatch.
        unsafe { Sys::isr_exit() };
        assert_eq!(port::pend_count::<Sys>(), 0);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_A));

        // Only the outermost exit requests the (single) switch.
        unsafe { Sys::isr_exit() };
        assert_eq!(port::pend_count::<Sys>(), 1);
        assert_eq!(port::resolve_pending::<Sys>(), 1);

        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_H2));
        assert_eq!(port::dispatch_count::<Sys>(), before + 1);
        assert_eq!(
            System::<Sys>::sched_snapshot().unwrap().state,
            SchedState::empty()
        );
    }
}

mod isr_without_pending_change {
    use super::*;
    use rook_kernel::{PortToKernel, StackStorage, System, ThreadCb};

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 0,
    });

    static THREAD_A: ThreadCb<Sys> = ThreadCb::new();
    static STACK_A: StackStorage<512> = StackStorage::new();

    #[test]
    fn exit_without_reschedule_pressure_is_free() {
        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::thread_init(&THREAD_A, super::noop, 0, &STACK_A, 5).unwrap();
        port::boot::<Sys>();

        unsafe { Sys::isr_enter() };
        unsafe { Sys::isr_exit() };

        assert_eq!(port::pend_count::<Sys>(), 0);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_A));
    }
}
