//! Kernel lifecycle: init, start, termination, hooks, registry.
use rook_port_hosted::{self as port, use_port};

fn noop(_: usize) {}

mod start_dispatches_single_thread {
    use super::*;
    use rook_kernel::{SchedState, StackStorage, System, ThreadCb};

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 0,
    });

    static THREAD_A: ThreadCb<Sys> = ThreadCb::new();
    static STACK_A: StackStorage<512> = StackStorage::new();

    #[test]
    fn start_dispatches_single_thread() {
        use port::PortInstance;

        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::thread_init(&THREAD_A, super::noop, 0, &STACK_A, 5).unwrap();

        port::boot::<Sys>();

        assert!(Sys::port_state().is_started());
        let snapshot = System::<Sys>::sched_snapshot().unwrap();
        assert_eq!(snapshot.state, SchedState::empty());
        assert_eq!(snapshot.lock_depth, 0);
        assert_eq!(snapshot.isr_depth, 0);

        let current = port::expect_current::<Sys>();
        assert!(std::ptr::eq(current, &THREAD_A));
        let pending = System::<Sys>::pending_thread().unwrap().unwrap();
        assert!(std::ptr::eq(pending, &THREAD_A));

        assert_eq!(System::<Sys>::tick_now().unwrap(), 0);
    }
}

mod init_creates_idle_thread {
    use super::*;
    use rook_kernel::{StackStorage, System, ThreadCb};

    use_port!(struct Sys {
        levels: 16,
        buckets: 16,
        quantum: 0,
    });

    static THREAD_A: ThreadCb<Sys> = ThreadCb::new();
    static STACK_A: StackStorage<512> = StackStorage::new();

    #[test]
    fn init_creates_idle_thread() {
        port::init_logging();
        System::<Sys>::init().unwrap();

        // Before any application thread exists, the idle thread (reserved
        // priority 0) is the only pending candidate.
        let idle = System::<Sys>::pending_thread().unwrap().unwrap();
        assert_eq!(System::<Sys>::thread_get_priority(idle).unwrap(), 0);

        System::<Sys>::thread_init(&THREAD_A, super::noop, 0, &STACK_A, 3).unwrap();
        let pending = System::<Sys>::pending_thread().unwrap().unwrap();
        assert!(std::ptr::eq(pending, &THREAD_A));
    }
}

mod thread_termination {
    use super::*;
    use rook_kernel::{StackStorage, System, ThreadCb};

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 0,
    });

    static THREAD_A: ThreadCb<Sys> = ThreadCb::new();
    static STACK_A: StackStorage<512> = StackStorage::new();
    static THREAD_B: ThreadCb<Sys> = ThreadCb::new();
    static STACK_B: StackStorage<512> = StackStorage::new();

    #[test]
    fn terminating_hands_off_to_next_thread() {
        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::thread_init(&THREAD_A, super::noop, 0, &STACK_A, 9).unwrap();
        System::<Sys>::thread_init(&THREAD_B, super::noop, 0, &STACK_B, 4).unwrap();
        port::boot::<Sys>();

        // The higher-priority thread runs first and terminates itself.
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_A));
        port::terminate_current::<Sys>();

        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_B));
    }
}

mod hook_table {
    use super::*;
    use rook_kernel::{HookTable, StackStorage, System, ThreadCb};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static INIT_HOOKS: AtomicUsize = AtomicUsize::new(0);
    static SWITCHES: AtomicUsize = AtomicUsize::new(0);

    fn on_kernel_init() {
        INIT_HOOKS.fetch_add(1, Ordering::SeqCst);
    }

    fn on_switch(_from: Option<&'static ThreadCb<Sys>>, _to: &'static ThreadCb<Sys>) {
        SWITCHES.fetch_add(1, Ordering::SeqCst);
    }

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 0,
        hooks: HookTable::<Sys> {
            kernel_init: Some(on_kernel_init),
            context_switch: Some(on_switch),
            ..HookTable::NONE
        },
    });

    static THREAD_A: ThreadCb<Sys> = ThreadCb::new();
    static STACK_A: StackStorage<512> = StackStorage::new();
    static THREAD_B: ThreadCb<Sys> = ThreadCb::new();
    static STACK_B: StackStorage<512> = StackStorage::new();

    #[test]
    fn hooks_fire_on_init_and_switch() {
        port::init_logging();
        System::<Sys>::init().unwrap();
        assert_eq!(INIT_HOOKS.load(Ordering::SeqCst), 1);

        System::<Sys>::thread_init(&THREAD_A, super::noop, 0, &STACK_A, 5).unwrap();
        port::boot::<Sys>();
        // The first dispatch reports an absent outgoing thread.
        assert_eq!(SWITCHES.load(Ordering::SeqCst), 1);

        // Readying a higher-priority thread preempts and fires the hook
        // again.
        System::<Sys>::thread_init(&THREAD_B, super::noop, 0, &STACK_B, 8).unwrap();
        assert_eq!(SWITCHES.load(Ordering::SeqCst), 2);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_B));
    }
}

mod registry {
    use super::*;
    use rook_kernel::{StackStorage, System, ThreadCb};

    use_port!(struct Sys {
        levels: 8,
        buckets: 8,
        quantum: 0,
    });

    static THREAD_A: ThreadCb<Sys> = ThreadCb::new();
    static STACK_A: StackStorage<512> = StackStorage::new();

    #[test]
    fn names_and_enumeration() {
        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::thread_init(&THREAD_A, super::noop, 0, &STACK_A, 2).unwrap();
        System::<Sys>::thread_set_name(&THREAD_A, "worker").unwrap();

        assert_eq!(System::<Sys>::thread_name(&THREAD_A).unwrap(), Some("worker"));

        // The registry lists the application thread and the idle thread.
        let mut count = 0;
        let mut saw_worker = false;
        System::<Sys>::for_each_thread(|t| {
            count += 1;
            if std::ptr::eq(t, &THREAD_A) {
                saw_worker = true;
            }
        })
        .unwrap();
        assert_eq!(count, 2);
        assert!(saw_worker);
    }
}

mod power_save_sleep {
    use super::*;
    use rook_kernel::{StackStorage, System, ThreadCb};

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 0,
    });

    static THREAD_A: ThreadCb<Sys> = ThreadCb::new();
    static STACK_A: StackStorage<512> = StackStorage::new();
    static THREAD_H: ThreadCb<Sys> = ThreadCb::new();
    static STACK_H: StackStorage<512> = StackStorage::new();

    #[test]
    fn sleep_until_interrupt_readies_work() {
        use port::PortInstance;
        use rook_kernel::PortToKernel;

        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::thread_init(&THREAD_A, super::noop, 0, &STACK_A, 5).unwrap();
        port::boot::<Sys>();

        // The "interrupt" that ends the wait readies a higher-priority
        // thread.
        Sys::port_state().on_next_dispatch(|| {
            unsafe { Sys::isr_enter() };
            System::<Sys>::thread_init(&THREAD_H, super::noop, 0, &STACK_H, 9).unwrap();
            unsafe { Sys::isr_exit() };
        });

        System::<Sys>::sleep().unwrap();
        port::resolve_pending::<Sys>();

        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_H));
    }
}
