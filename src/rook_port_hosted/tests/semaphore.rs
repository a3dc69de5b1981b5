//! Counting semaphore semantics.
use rook_port_hosted::{self as port, use_port};

fn noop(_: usize) {}

mod signal_then_wait_roundtrip {
    use super::*;
    use rook_kernel::{SemaphoreCb, StackStorage, System, ThreadCb};

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 0,
    });

    static THREAD_A: ThreadCb<Sys> = ThreadCb::new();
    static STACK_A: StackStorage<512> = StackStorage::new();
    static SEM: SemaphoreCb<Sys> = SemaphoreCb::new();

    #[test]
    fn signal_then_wait_roundtrip() {
        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::sem_init(&SEM, 0).unwrap();
        System::<Sys>::thread_init(&THREAD_A, super::noop, 0, &STACK_A, 5).unwrap();
        port::boot::<Sys>();

        System::<Sys>::sem_signal(&SEM).unwrap();
        assert_eq!(System::<Sys>::sem_count(&SEM).unwrap(), 1);

        // The permit is consumed without blocking.
        assert_eq!(System::<Sys>::sem_wait(&SEM), Ok(()));
        assert_eq!(System::<Sys>::sem_count(&SEM).unwrap(), 0);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_A));
    }
}

mod signal_wakes_blocked_waiter {
    use super::*;
    use port::PortInstance;
    use rook_kernel::{SemaphoreCb, StackStorage, System, ThreadCb};

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 0,
    });

    static THREAD_A: ThreadCb<Sys> = ThreadCb::new();
    static STACK_A: StackStorage<512> = StackStorage::new();
    static THREAD_B: ThreadCb<Sys> = ThreadCb::new();
    static STACK_B: StackStorage<512> = StackStorage::new();
    static SEM: SemaphoreCb<Sys> = SemaphoreCb::new();

    #[test]
    fn signal_wakes_blocked_waiter() {
        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::sem_init(&SEM, 0).unwrap();
        System::<Sys>::thread_init(&THREAD_A, super::noop, 0, &STACK_A, 5).unwrap();
        System::<Sys>::thread_init(&THREAD_B, super::noop, 0, &STACK_B, 10).unwrap();
        port::boot::<Sys>();

        // B blocks; while it is switched out, A signals. B's wait call
        // must come back with the signaled result.
        Sys::port_state().on_next_dispatch(|| {
            assert_eq!(System::<Sys>::sem_count(&SEM).unwrap(), -1);
            System::<Sys>::sem_signal(&SEM).unwrap();
        });

        assert_eq!(System::<Sys>::sem_wait(&SEM), Ok(()));
        assert_eq!(System::<Sys>::sem_count(&SEM).unwrap(), 0);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_B));
    }
}

mod priority_ordered_wakeup {
    use super::*;
    use rook_kernel::{SemaphoreCb, StackStorage, System, ThreadCb};

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 0,
    });

    static THREAD_H: ThreadCb<Sys> = ThreadCb::new();
    static STACK_H: StackStorage<512> = StackStorage::new();
    static THREAD_M: ThreadCb<Sys> = ThreadCb::new();
    static STACK_M: StackStorage<512> = StackStorage::new();
    static SEM: SemaphoreCb<Sys> = SemaphoreCb::new();

    #[test]
    fn priority_ordered_wakeup() {
        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::sem_init(&SEM, 0).unwrap();
        System::<Sys>::thread_init(&THREAD_H, super::noop, 0, &STACK_H, 8).unwrap();
        System::<Sys>::thread_init(&THREAD_M, super::noop, 0, &STACK_M, 5).unwrap();
        port::boot::<Sys>();

        // H blocks first (it runs first), then M blocks, leaving the idle
        // thread running.
        let _ = System::<Sys>::sem_wait(&SEM);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_M));
        let _ = System::<Sys>::sem_wait(&SEM);
        assert_eq!(System::<Sys>::sem_count(&SEM).unwrap(), -2);

        // The first signal must go to the higher-priority waiter, and the
        // woken thread preempts the idle thread at once.
        System::<Sys>::sem_signal(&SEM).unwrap();
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_H));
        assert_eq!(System::<Sys>::sem_count(&SEM).unwrap(), -1);

        System::<Sys>::sem_signal(&SEM).unwrap();
        assert_eq!(System::<Sys>::sem_count(&SEM).unwrap(), 0);
        // M is ready again but H keeps the processor.
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_H));
    }
}

mod fifo_among_equal_priorities {
    use super::*;
    use rook_kernel::{SemaphoreCb, StackStorage, System, ThreadCb};

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 0,
    });

    static THREAD_A1: ThreadCb<Sys> = ThreadCb::new();
    static STACK_A1: StackStorage<512> = StackStorage::new();
    static THREAD_A2: ThreadCb<Sys> = ThreadCb::new();
    static STACK_A2: StackStorage<512> = StackStorage::new();
    static SEM: SemaphoreCb<Sys> = SemaphoreCb::new();

    #[test]
    fn fifo_among_equal_priorities() {
        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::sem_init(&SEM, 0).unwrap();
        System::<Sys>::thread_init(&THREAD_A1, super::noop, 0, &STACK_A1, 5).unwrap();
        System::<Sys>::thread_init(&THREAD_A2, super::noop, 0, &STACK_A2, 5).unwrap();
        port::boot::<Sys>();

        // Equal priority: creation order decides who runs first, so A1
        // blocks first, then A2.
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_A1));
        let _ = System::<Sys>::sem_wait(&SEM);
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_A2));
        let _ = System::<Sys>::sem_wait(&SEM);

        // The first signal wakes the first blocker.
        System::<Sys>::sem_signal(&SEM).unwrap();
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_A1));
    }
}

mod termination_wakes_with_object_removed {
    use super::*;
    use port::PortInstance;
    use rook_kernel::{SemaphoreCb, StackStorage, System, ThreadCb, WaitError};

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 0,
    });

    static THREAD_A: ThreadCb<Sys> = ThreadCb::new();
    static STACK_A: StackStorage<512> = StackStorage::new();
    static SEM: SemaphoreCb<Sys> = SemaphoreCb::new();

    #[test]
    fn termination_wakes_with_object_removed() {
        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::sem_init(&SEM, 0).unwrap();
        System::<Sys>::thread_init(&THREAD_A, super::noop, 0, &STACK_A, 3).unwrap();
        port::boot::<Sys>();

        // The semaphore dies while A is blocked on it.
        Sys::port_state().on_next_dispatch(|| {
            System::<Sys>::sem_term(&SEM).unwrap();
        });

        assert_eq!(System::<Sys>::sem_wait(&SEM), Err(WaitError::ObjectRemoved));
        assert!(std::ptr::eq(port::expect_current::<Sys>(), &THREAD_A));
    }
}

mod wait_with_timeout {
    use super::*;
    use port::PortInstance;
    use rook_kernel::{SemaphoreCb, StackStorage, System, ThreadCb, WaitError};

    use_port!(struct Sys {
        levels: 32,
        buckets: 32,
        quantum: 0,
    });

    static THREAD_A: ThreadCb<Sys> = ThreadCb::new();
    static STACK_A: StackStorage<512> = StackStorage::new();
    static SEM: SemaphoreCb<Sys> = SemaphoreCb::new();
    static SEM2: SemaphoreCb<Sys> = SemaphoreCb::new();

    #[test]
    fn timeout_aborts_the_wait() {
        port::init_logging();
        System::<Sys>::init().unwrap();
        System::<Sys>::sem_init(&SEM, 0).unwrap();
        System::<Sys>::sem_init(&SEM2, 0).unwrap();
        System::<Sys>::thread_init(&THREAD_A, super::noop, 0, &STACK_A, 5).unwrap();
        port::boot::<Sys>();

        // Nothing signals; the third tick expires the wait.
        Sys::port_state().on_next_dispatch(|| {
            port::run_ticks::<Sys>(3);
        });
        assert_eq!(
            System::<Sys>::sem_wait_timeout(&SEM, 3),
            Err(WaitError::Timeout)
        );
        // The aborted decrement is undone.
        assert_eq!(System::<Sys>::sem_count(&SEM).unwrap(), 0);

        // A signal arriving before the deadline wins; the timeout is
        // disarmed and later ticks are inert.
        Sys::port_state().on_next_dispatch(|| {
            port::run_ticks::<Sys>(1);
            System::<Sys>::sem_signal(&SEM2).unwrap();
        });
        assert_eq!(System::<Sys>::sem_wait_timeout(&SEM2, 5), Ok(()));
        port::run_ticks::<Sys>(10);
        assert_eq!(System::<Sys>::sem_count(&SEM2).unwrap(), 0);
    }
}
