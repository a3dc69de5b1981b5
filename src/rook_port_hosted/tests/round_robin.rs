//! Round-robin time slicing among equal priorities.
use rook_port_hosted::{self as port, use_port};

fn noop(_: usize) {}

mod rotation_every_quantum {
    use super::*;
    use rook_kernel::{StackStorage, System, ThreadCb};

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 10,
    });

    static THREAD_T1: ThreadCb<Sys> = ThreadCb::new();
    static STACK_T1: StackStorage<512> = StackStorage::new();
    static THREAD_T2: ThreadCb<Sys> = ThreadCb::new();
    static STACK_T2: StackStorage<512> = StackStorage::new();
    static THREAD_T3: ThreadCb<Sys> = ThreadCb::new();
    static STACK_T3: StackStorage<512> = StackStorage::new();

    #[test]
    fn rotation_every_quantum() {
        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::thread_init(&THREAD_T1, super::noop, 0, &STACK_T1, 5).unwrap();
        System::<Sys>::thread_init(&THREAD_T2, super::noop, 0, &STACK_T2, 5).unwrap();
        System::<Sys>::thread_init(&THREAD_T3, super::noop, 0, &STACK_T3, 5).unwrap();
        port::boot::<Sys>();

        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_T1));

        // The slice lasts the full quantum.
        port::run_ticks::<Sys>(9);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_T1));

        // Expiry rotates to the next thread of the class, FIFO.
        port::run_ticks::<Sys>(1);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_T2));

        port::run_ticks::<Sys>(10);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_T3));

        // A full cycle returns to the first thread: equal CPU share.
        port::run_ticks::<Sys>(10);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_T1));
    }
}

mod no_rotation_while_locked {
    use super::*;
    use rook_kernel::{StackStorage, System, ThreadCb};

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 10,
    });

    static THREAD_T1: ThreadCb<Sys> = ThreadCb::new();
    static STACK_T1: StackStorage<512> = StackStorage::new();
    static THREAD_T2: ThreadCb<Sys> = ThreadCb::new();
    static STACK_T2: StackStorage<512> = StackStorage::new();

    #[test]
    fn no_rotation_while_locked() {
        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::thread_init(&THREAD_T1, super::noop, 0, &STACK_T1, 5).unwrap();
        System::<Sys>::thread_init(&THREAD_T2, super::noop, 0, &STACK_T2, 5).unwrap();
        port::boot::<Sys>();

        System::<Sys>::lock_enter().unwrap();
        port::run_ticks::<Sys>(25);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_T1));
        System::<Sys>::lock_exit().unwrap();

        // Slicing resumes from a full quantum once unlocked.
        port::run_ticks::<Sys>(9);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_T1));
        port::run_ticks::<Sys>(1);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_T2));
    }
}

mod higher_priority_unperturbed {
    use super::*;
    use rook_kernel::{StackStorage, System, ThreadCb};

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 10,
    });

    static THREAD_T1: ThreadCb<Sys> = ThreadCb::new();
    static STACK_T1: StackStorage<512> = StackStorage::new();
    static THREAD_T2: ThreadCb<Sys> = ThreadCb::new();
    static STACK_T2: StackStorage<512> = StackStorage::new();
    static THREAD_H: ThreadCb<Sys> = ThreadCb::new();
    static STACK_H: StackStorage<512> = StackStorage::new();

    #[test]
    fn higher_priority_unperturbed() {
        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::thread_init(&THREAD_T1, super::noop, 0, &STACK_T1, 5).unwrap();
        System::<Sys>::thread_init(&THREAD_T2, super::noop, 0, &STACK_T2, 5).unwrap();
        System::<Sys>::thread_init(&THREAD_H, super::noop, 0, &STACK_H, 9).unwrap();
        port::boot::<Sys>();

        // H outranks the sliced class and keeps the processor through any
        // number of quantum expirations.
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_H));
        port::run_ticks::<Sys>(35);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_H));
    }
}
