//! A fixed-priority preemptive RTOS kernel core for single-core embedded
//! microcontrollers.
//!
//! The kernel provides preemptive multithreading with optional round-robin
//! time slicing among equal-priority threads, blocking counting semaphores,
//! and one-shot virtual timers driven by a periodic hardware tick.
//!
//! # Structure
//!
//! The kernel is generic over a system type implementing the port traits
//! ([`PortThreading`], [`PortInterrupts`], [`PortTimer`]) and the
//! configuration trait ([`KernelCfg`]). The port supplies everything that
//! is architecture-specific: the context switcher, the interrupt mask, the
//! synthetic stack frame builder, and the tick source. The kernel API is
//! exposed as associated functions of [`System`]`<Traits>`; the entry
//! points a port calls back into live on [`PortToKernel`].
//!
//! All scheduler state resides in one [`KernelState`] per system, placed in
//! `static` storage by the configuration. Thread, semaphore, and timer
//! control blocks are caller-owned; the kernel links them into its internal
//! queues but never allocates or frees anything.
//!
//! # Contexts
//!
//! A kernel service is callable from a *thread context* (possibly while the
//! scheduler lock is held) or an *interrupt context* bracketed by
//! [`PortToKernel::isr_enter`] and [`PortToKernel::isr_exit`]. Blocking
//! services require an unlocked thread context. Services acquire the
//! interrupt critical section internally; calling them while the caller
//! already holds it fails with [`BadContextError::BadContext`].
//!
//! Interrupts with priorities above
//! [`PortInterrupts::ISR_MAX_PRIORITY`] are never masked by the kernel and
//! in exchange may not call kernel services.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
use core::marker::PhantomData;

pub mod error;
pub mod hook;
mod klock;
pub mod readyqueue;
mod sched;
pub mod semaphore;
pub mod thread;
pub mod timeout;
pub mod utils;

pub use self::{
    error::{BadContextError, WaitError},
    hook::{AssertInfo, HookTable},
    readyqueue::{BitmapQueue, Queue},
    sched::{CriticalToken, SchedSnapshot, SchedState},
    semaphore::SemaphoreCb,
    thread::{StackRegion, StackStorage, ThreadCb, ThreadEntry},
    timeout::{TimerCb, TimerFn},
    utils::Init,
};

use self::hook::api_assert;
#[cfg(feature = "registry")]
use self::{klock::CpuLockCell, readyqueue::ThreadRef};

/// Thread priority. Larger values are more urgent. The values `0` and
/// `PRIORITY_LEVELS - 1` are reserved for internal threads.
pub type Priority = u8;

/// Round-robin slice length, in ticks.
pub type Quantum = u32;

/// A relative tick count (timer deltas, delays, timeouts).
pub type Ticks = u32;

/// An absolute tick count since kernel start.
pub type TickCount = u64;

/// A semaphore count. Negative magnitude equals the number of waiters.
pub type SemCount = i32;

/// A hardware interrupt priority, in the port's numbering.
pub type InterruptPriority = u8;

/// Implemented by a port to provide the thread-switching primitives.
///
/// # Safety
///
/// The implementation must uphold the documented behavior of every method;
/// the kernel's memory safety depends on it.
pub unsafe trait PortThreading: Sized + 'static {
    /// Per-thread state owned by the port, embedded at the start of each
    /// [`ThreadCb`]. Holds at least the saved stack pointer.
    type PortThreadState: Send + Sync + Init + core::fmt::Debug + 'static;

    /// The smallest stack the port's frame builder can work with, in bytes.
    const STACK_MIN_SIZE: usize;

    /// Stack alignment required by the port's calling convention.
    const STACK_ALIGN: usize = 8;

    /// Construct a synthetic interrupt-return frame at the top of `stack`
    /// such that the first context restore into `thread` enters
    /// `entry.entry` with `entry.param` in the first-parameter register and
    /// interrupts enabled.
    ///
    /// # Safety
    ///
    /// Called by the kernel with the CPU lock active, on a thread that is
    /// not running.
    unsafe fn initialize_thread_state(
        thread: &'static ThreadCb<Self>,
        entry: ThreadEntry,
        stack: StackRegion,
    ) where
        Self: KernelCfg;

    /// Install the pending thread's stack and enter thread mode. Releases
    /// the CPU lock the kernel left active. Does not return.
    ///
    /// # Safety
    ///
    /// Only called once, by [`System::start`].
    unsafe fn dispatch_first_thread() -> !
    where
        Self: KernelCfg;

    /// Request a context switch from thread context: save the outgoing
    /// thread's callee-saved registers, call
    /// [`PortToKernel::complete_context_switch`], and restore the incoming
    /// thread's registers.
    ///
    /// # Safety
    ///
    /// Called by the kernel with the CPU lock inactive.
    unsafe fn dispatch()
    where
        Self: KernelCfg;

    /// Request a deferred context switch from the outermost interrupt
    /// handler epilogue, typically by pending the lowest-priority software
    /// exception. The handler performs the same steps as
    /// [`dispatch`](Self::dispatch).
    ///
    /// # Safety
    ///
    /// Called by the kernel on the outermost ISR exit, with the CPU lock
    /// inactive.
    unsafe fn pend_dispatch()
    where
        Self: KernelCfg;

    /// Discard the outgoing thread's context and dispatch to the pending
    /// thread. Does not return. The outgoing thread's stack is dead.
    ///
    /// # Safety
    ///
    /// Called by the kernel with the CPU lock active; the port reclaims it.
    unsafe fn exit_and_dispatch(thread: &'static ThreadCb<Self>) -> !
    where
        Self: KernelCfg;

    /// Wait for an interrupt, e.g. with a `wfi` instruction. Used by the
    /// idle thread and the power-save sleep loop.
    ///
    /// # Safety
    ///
    /// Called from thread context with the CPU lock inactive.
    unsafe fn wait_for_interrupt()
    where
        Self: KernelCfg,
    {
    }
}

/// Implemented by a port to provide the interrupt mask (the CPU lock).
///
/// Entering the CPU lock raises the interrupt priority mask to the
/// scheduler threshold; leaving restores it. Interrupts above
/// [`ISR_MAX_PRIORITY`](Self::ISR_MAX_PRIORITY) stay enabled throughout and
/// must not call kernel services.
///
/// # Safety
///
/// The implementation must uphold the documented behavior of every method.
pub unsafe trait PortInterrupts: Sized + 'static {
    /// The highest interrupt priority whose handlers may call kernel
    /// services.
    const ISR_MAX_PRIORITY: InterruptPriority;

    /// Activate the CPU lock.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, with the lock inactive.
    unsafe fn enter_cpu_lock();

    /// Deactivate the CPU lock, restoring the previous interrupt mask.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, with the lock active.
    unsafe fn leave_cpu_lock();

    /// Activate the CPU lock if it is inactive. Returns `false` if it was
    /// already active.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Check if the CPU lock is active.
    fn is_cpu_lock_active() -> bool;
}

/// Implemented by a port to provide the periodic tick source.
///
/// # Safety
///
/// The port must arrange for [`PortToKernel::timer_tick`] to be called at
/// the configured rate, from an interrupt bracketed by
/// [`PortToKernel::isr_enter`] and [`PortToKernel::isr_exit`].
pub unsafe trait PortTimer: Sized + 'static {
    /// The tick rate the port's hardware timer is configured for.
    const TICK_FREQ_HZ: u32;
}

/// Umbrella trait over the port traits.
pub trait Port: PortThreading + PortInterrupts + PortTimer {}
impl<T: PortThreading + PortInterrupts + PortTimer> Port for T {}

/// Compile-time kernel configuration, implemented on the system type next
/// to the port traits.
///
/// # Safety
///
/// The accessor methods must return the same storage on every call, and
/// that storage must not be aliased by anything else.
pub unsafe trait KernelCfg: Port + Send + Sync + Sized + 'static {
    /// The number of priority levels, in `3..=256`. Levels `0` (idle) and
    /// `PRIORITY_LEVELS - 1` (reserved for a timer thread configuration)
    /// are not available to applications.
    const PRIORITY_LEVELS: usize;

    /// Round-robin slice in ticks. `0` disables time slicing.
    const TIME_QUANTUM: Quantum;

    /// The priority-indexed queue type used for the ready queue and for
    /// every semaphore's waiter queue. Instantiate
    /// [`BitmapQueue`]`<Self, PRIORITY_LEVELS, PRIORITY_BUCKETS>` with
    /// `PRIORITY_BUCKETS` a power of two not exceeding `PRIORITY_LEVELS`.
    type ThreadQueue: Queue<Self>;

    /// The installed hook table.
    const HOOKS: HookTable<Self> = HookTable::<Self>::NONE;

    /// The kernel state singleton.
    fn state() -> &'static KernelState<Self>;

    /// Storage for the internal idle thread.
    fn idle_thread() -> &'static ThreadCb<Self>;

    /// Stack for the internal idle thread; at least
    /// [`PortThreading::STACK_MIN_SIZE`] bytes.
    fn idle_stack() -> StackRegion;
}

/// The complete bundle of traits a system type implements.
pub trait KernelTraits: KernelCfg {}
impl<T: KernelCfg> KernelTraits for T {}

/// The kernel-owned process-wide state: scheduler context, ready queue,
/// and timer list. Initialized once at kernel init, valid until the kernel
/// terminates.
pub struct KernelState<Traits: KernelCfg> {
    pub(crate) sched: sched::SchedCtx<Traits>,
    pub(crate) run_queue: Traits::ThreadQueue,
    pub(crate) timeouts: timeout::TimeoutGlobals<Traits>,

    #[cfg(feature = "registry")]
    pub(crate) registry: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
}

impl<Traits: KernelCfg> Init for KernelState<Traits> {
    const INIT: Self = Self {
        sched: Init::INIT,
        run_queue: Init::INIT,
        timeouts: Init::INIT,
        #[cfg(feature = "registry")]
        registry: Init::INIT,
    };
}

impl<Traits: KernelTraits> core::fmt::Debug for KernelState<Traits> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("KernelState")
            .field("run_queue", &self.run_queue)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

/// Represents one kernel instance, parameterized by its configuration and
/// port. Every kernel API function is an associated function of this type.
pub struct System<Traits>(PhantomData<Traits>);

/// The kernel-side entry points a port calls.
pub trait PortToKernel {
    /// Bracket the entry of every interrupt handler that may call kernel
    /// services. Nestable; must be paired with
    /// [`isr_exit`](Self::isr_exit).
    ///
    /// # Safety
    ///
    /// Only meant to be called by interrupt handler prologues.
    unsafe fn isr_enter();

    /// Bracket the exit of every interrupt handler. The outermost exit
    /// performs the deferred context switch evaluation.
    ///
    /// # Safety
    ///
    /// Only meant to be called by interrupt handler epilogues, paired with
    /// [`isr_enter`](Self::isr_enter).
    unsafe fn isr_exit();

    /// Advance the kernel clock by one tick: expire virtual timers and run
    /// the round-robin accounting.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port's periodic tick interrupt,
    /// inside an [`isr_enter`](Self::isr_enter) bracket.
    unsafe fn timer_tick();

    /// Make the pending thread current. Called by the port's dispatch
    /// handler after it saved the outgoing thread's context and before it
    /// restores the incoming thread's.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port's dispatch handler, with the
    /// CPU lock inactive.
    unsafe fn complete_context_switch();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn isr_enter() {
        sched::isr_enter_body::<Traits>();
    }

    unsafe fn isr_exit() {
        sched::isr_exit_body::<Traits>();
    }

    unsafe fn timer_tick() {
        let lock = sched::isr_lock::<Traits>();
        api_assert!(
            Traits,
            !Traits::state().sched.state.get(&*lock).contains(SchedState::INACTIVE),
            "tick before kernel init",
        );

        hook::at_tick::<Traits>();

        let mut lock = timeout::handle_tick(lock);
        sched::quantum_tick(lock.borrow_mut());
    }

    unsafe fn complete_context_switch() {
        sched::complete_context_switch_body::<Traits>();
    }
}
