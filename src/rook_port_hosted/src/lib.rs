//! Simulation environment for driving the `rook` kernel on a hosted
//! target.
//!
//! The port does not execute thread bodies. It mocks the platform contract
//! just faithfully enough to drive the scheduler state machine from
//! ordinary host code:
//!
//!  - The CPU lock is an atomic flag.
//!  - An immediate dispatch request (`PortThreading::dispatch`) completes
//!    synchronously: the pending thread becomes current, then the queued
//!    "while switched out" closures run (they stand in for the work other
//!    threads and interrupts perform while the caller is off the
//!    processor), then the switch completes again so the processor lands
//!    on whoever is pending by that point. A blocking call that switches
//!    away therefore returns to its caller immediately; its return value
//!    is meaningful once a queued closure has re-readied the caller.
//!  - A deferred dispatch request (`PortThreading::pend_dispatch`) is
//!    counted and performed by [`resolve_pending`], the way hardware takes
//!    a pended low-priority exception once the interrupt mask drops.
//!  - The diverging primitives (`dispatch_first_thread`,
//!    `exit_and_dispatch`) unwind with a typed panic payload that
//!    [`boot`] and [`terminate_current`] catch.
//!
//! Tests declare a system type per scenario with [`use_port!`], giving
//! every test its own isolated kernel instance.
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rook_kernel::{
    utils::Init, KernelTraits, PortThreading, PortToKernel, StackRegion, System, ThreadCb,
    ThreadEntry,
};
use spin::Mutex as SpinMutex;

/// Used by [`use_port!`].
#[doc(hidden)]
pub use rook_kernel;

/// The port's per-thread state: a simulated saved stack pointer.
#[derive(Debug)]
pub struct ThreadState {
    /// Top-of-stack address the synthetic frame was built at.
    pub sp: AtomicUsize,
    pub initialized: AtomicBool,
}

impl Init for ThreadState {
    const INIT: Self = Self {
        sp: AtomicUsize::new(0),
        initialized: AtomicBool::new(false),
    };
}

type DispatchHook = Box<dyn FnOnce() + Send>;

/// The internal state of the port.
pub struct State {
    cpu_lock: AtomicBool,
    started: AtomicBool,
    dispatch_count: AtomicUsize,
    pend_count: AtomicUsize,
    on_dispatch: SpinMutex<Vec<DispatchHook>>,
}

impl State {
    pub const fn new() -> Self {
        Self {
            cpu_lock: AtomicBool::new(false),
            started: AtomicBool::new(false),
            dispatch_count: AtomicUsize::new(0),
            pend_count: AtomicUsize::new(0),
            on_dispatch: SpinMutex::new(Vec::new()),
        }
    }

    /// Queue work to run inside the next dispatch, standing in for code
    /// that other threads or interrupts execute while the caller is
    /// switched out. Hooks run in FIFO order.
    pub fn on_next_dispatch(&self, f: impl FnOnce() + Send + 'static) {
        self.on_dispatch.lock().push(Box::new(f));
    }

    pub fn enter_cpu_lock(&self) {
        let was_active = self.cpu_lock.swap(true, Ordering::SeqCst);
        debug_assert!(!was_active, "CPU lock entered twice");
    }

    pub fn leave_cpu_lock(&self) {
        self.cpu_lock.store(false, Ordering::SeqCst);
    }

    pub fn try_enter_cpu_lock(&self) -> bool {
        !self.cpu_lock.swap(true, Ordering::SeqCst)
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.cpu_lock.load(Ordering::SeqCst)
    }

    /// Whether `dispatch_first_thread` ran.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn take_hook(&self) -> Option<DispatchHook> {
        let mut queue = self.on_dispatch.lock();
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented on a system type by [`use_port!`].
pub trait PortInstance:
    KernelTraits + PortToKernel + PortThreading<PortThreadState = ThreadState>
{
    fn port_state() -> &'static State;
}

/// Panic payload of [`dispatch_first`]: the kernel handed the processor to
/// its first thread.
#[derive(Debug)]
pub struct DispatchedFirst;

/// Panic payload of [`exit_and_dispatch`]: the current thread's stack was
/// discarded.
#[derive(Debug)]
pub struct ThreadExited;

/// The port body of [`PortThreading::initialize_thread_state`]: records an
/// 8-byte-aligned top-of-stack as the simulated synthetic frame.
///
/// [`PortThreading::initialize_thread_state`]: rook_kernel::PortThreading::initialize_thread_state
pub fn initialize_thread_state<S: PortInstance>(
    thread: &'static ThreadCb<S>,
    entry: ThreadEntry,
    stack: StackRegion,
) {
    // Thread bodies never run in this port; the entry only matters for the
    // frame it would be built into.
    let _ = entry;
    let top = (stack.start as usize + stack.len) & !7usize;
    thread.port_thread_state.sp.store(top, Ordering::SeqCst);
    thread.port_thread_state.initialized.store(true, Ordering::SeqCst);
}

/// The port body of [`PortThreading::dispatch`].
///
/// The pending thread becomes current, the queued switched-out closures
/// run "as" that thread, and a final completion returns the processor to
/// whoever is pending by then (usually the original caller, once a closure
/// has re-readied it).
///
/// [`PortThreading::dispatch`]: rook_kernel::PortThreading::dispatch
pub fn dispatch<S: PortInstance>() {
    log::trace!("dispatch requested");
    // Safety: called with the CPU lock inactive, like the real dispatch
    // exception handler
    unsafe { S::complete_context_switch() };
    while let Some(hook) = S::port_state().take_hook() {
        hook();
    }
    // Safety: see above
    unsafe { S::complete_context_switch() };
    S::port_state().dispatch_count.fetch_add(1, Ordering::SeqCst);
}

/// The port body of [`PortThreading::pend_dispatch`].
///
/// [`PortThreading::pend_dispatch`]: rook_kernel::PortThreading::pend_dispatch
pub fn pend_dispatch<S: PortInstance>() {
    S::port_state().pend_count.fetch_add(1, Ordering::SeqCst);
}

/// Take any dispatch deferred from an ISR exit and perform it, the way
/// hardware takes a pended exception as soon as the mask drops. Returns
/// the number of requests that were outstanding.
pub fn resolve_pending<S: PortInstance>() -> usize {
    let pending = S::port_state().pend_count.swap(0, Ordering::SeqCst);
    if pending > 0 {
        dispatch::<S>();
    }
    pending
}

/// How many context switches the port performed.
pub fn dispatch_count<S: PortInstance>() -> usize {
    S::port_state().dispatch_count.load(Ordering::SeqCst)
}

/// How many deferred dispatch requests are outstanding.
pub fn pend_count<S: PortInstance>() -> usize {
    S::port_state().pend_count.load(Ordering::SeqCst)
}

/// The port body of [`PortThreading::dispatch_first_thread`].
///
/// [`PortThreading::dispatch_first_thread`]: rook_kernel::PortThreading::dispatch_first_thread
pub fn dispatch_first<S: PortInstance>() -> ! {
    S::port_state().started.store(true, Ordering::SeqCst);
    // The kernel leaves the CPU lock active for us to reclaim.
    S::port_state().leave_cpu_lock();
    std::panic::panic_any(DispatchedFirst)
}

/// The port body of [`PortThreading::exit_and_dispatch`].
///
/// [`PortThreading::exit_and_dispatch`]: rook_kernel::PortThreading::exit_and_dispatch
pub fn exit_and_dispatch<S: PortInstance>() -> ! {
    S::port_state().leave_cpu_lock();
    dispatch::<S>();
    std::panic::panic_any(ThreadExited)
}

/// The port body of [`PortThreading::wait_for_interrupt`]: runs one queued
/// hook, standing in for an interrupt arriving during the wait.
///
/// [`PortThreading::wait_for_interrupt`]: rook_kernel::PortThreading::wait_for_interrupt
pub fn wait_for_interrupt<S: PortInstance>() {
    if let Some(hook) = S::port_state().take_hook() {
        hook();
    }
}

/// Run [`System::start`] and catch the moment the port would enter the
/// first thread. On return the scheduler is in the running state.
pub fn boot<S: PortInstance>() {
    let result = catch_unwind(AssertUnwindSafe(|| -> ! { System::<S>::start() }));
    match result {
        Err(payload) if payload.is::<DispatchedFirst>() => {}
        Err(payload) => resume_unwind(payload),
        Ok(never) => match never {},
    }
}

/// Run [`System::thread_term`] and catch the port's exit signal.
pub fn terminate_current<S: PortInstance>() {
    let result = catch_unwind(AssertUnwindSafe(|| -> ! { System::<S>::thread_term() }));
    match result {
        Err(payload) if payload.is::<ThreadExited>() => {}
        Err(payload) => resume_unwind(payload),
        Ok(never) => match never {},
    }
}

/// Simulate one hardware tick: enter the tick interrupt, advance the
/// kernel clock, exit, and take any dispatch the exit pended.
pub fn tick<S: PortInstance>() {
    // Safety: mirrors the tick ISR's prologue and epilogue
    unsafe {
        S::isr_enter();
        S::timer_tick();
        S::isr_exit();
    }
    resolve_pending::<S>();
}

/// Simulate `n` hardware ticks.
pub fn run_ticks<S: PortInstance>(n: u32) {
    for _ in 0..n {
        tick::<S>();
    }
}

/// Get the currently running thread, which must exist.
pub fn expect_current<S: PortInstance>() -> &'static ThreadCb<S> {
    System::<S>::thread_get_current().expect("no current thread")
}

/// Install the logger used by the test suites. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Define a system type driven by this port.
///
/// Declares the given struct and implements the port traits, the kernel
/// configuration, and [`PortInstance`] on it, backed by its own set of
/// statics. Each invocation is a fully independent kernel instance.
///
/// ```ignore
/// rook_port_hosted::use_port!(pub struct SysTick {
///     levels: 32,
///     buckets: 32,
///     quantum: 10,
/// });
/// ```
#[macro_export]
macro_rules! use_port {
    (@or , $default:expr) => { $default };
    (@or $value:expr, $default:expr) => { $value };

    (
        $vis:vis struct $Sys:ident {
            levels: $levels:expr,
            buckets: $buckets:expr,
            quantum: $quantum:expr
            $(, idle_stack: $idle_stack:expr)?
            $(, hooks: $hooks:expr)?
            $(,)?
        }
    ) => {
        $vis struct $Sys;

        const _: () = {
            use $crate::rook_kernel as kernel;

            const IDLE_STACK_LEN: usize = $crate::use_port!(@or $($idle_stack)?, 4096);

            static KERNEL_STATE: kernel::KernelState<$Sys> =
                <kernel::KernelState<$Sys> as kernel::Init>::INIT;
            static PORT_STATE: $crate::State = $crate::State::new();
            static IDLE_THREAD: kernel::ThreadCb<$Sys> =
                <kernel::ThreadCb<$Sys> as kernel::Init>::INIT;
            static IDLE_STACK: kernel::StackStorage<IDLE_STACK_LEN> =
                kernel::StackStorage::new();

            unsafe impl kernel::PortThreading for $Sys {
                type PortThreadState = $crate::ThreadState;
                const STACK_MIN_SIZE: usize = 128;

                unsafe fn initialize_thread_state(
                    thread: &'static kernel::ThreadCb<Self>,
                    entry: kernel::ThreadEntry,
                    stack: kernel::StackRegion,
                ) {
                    $crate::initialize_thread_state::<Self>(thread, entry, stack);
                }

                unsafe fn dispatch_first_thread() -> ! {
                    $crate::dispatch_first::<Self>()
                }

                unsafe fn dispatch() {
                    $crate::dispatch::<Self>();
                }

                unsafe fn pend_dispatch() {
                    $crate::pend_dispatch::<Self>();
                }

                unsafe fn exit_and_dispatch(_thread: &'static kernel::ThreadCb<Self>) -> ! {
                    $crate::exit_and_dispatch::<Self>()
                }

                unsafe fn wait_for_interrupt() {
                    $crate::wait_for_interrupt::<Self>();
                }
            }

            unsafe impl kernel::PortInterrupts for $Sys {
                const ISR_MAX_PRIORITY: kernel::InterruptPriority = 15;

                unsafe fn enter_cpu_lock() {
                    <Self as $crate::PortInstance>::port_state().enter_cpu_lock();
                }

                unsafe fn leave_cpu_lock() {
                    <Self as $crate::PortInstance>::port_state().leave_cpu_lock();
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    <Self as $crate::PortInstance>::port_state().try_enter_cpu_lock()
                }

                fn is_cpu_lock_active() -> bool {
                    <Self as $crate::PortInstance>::port_state().is_cpu_lock_active()
                }
            }

            unsafe impl kernel::PortTimer for $Sys {
                const TICK_FREQ_HZ: u32 = 100;
            }

            unsafe impl kernel::KernelCfg for $Sys {
                const PRIORITY_LEVELS: usize = $levels;
                const TIME_QUANTUM: kernel::Quantum = $quantum;
                type ThreadQueue = kernel::BitmapQueue<Self, { $levels }, { $buckets }>;
                $( const HOOKS: kernel::HookTable<Self> = $hooks; )?

                fn state() -> &'static kernel::KernelState<Self> {
                    &KERNEL_STATE
                }

                fn idle_thread() -> &'static kernel::ThreadCb<Self> {
                    &IDLE_THREAD
                }

                fn idle_stack() -> kernel::StackRegion {
                    IDLE_STACK.region()
                }
            }

            impl $crate::PortInstance for $Sys {
                fn port_state() -> &'static $crate::State {
                    &PORT_STATE
                }
            }
        };
    };
}
