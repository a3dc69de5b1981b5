//! Scheduler core: the current/pending thread pair, the state machine, the
//! scheduler lock, ISR nesting, and round-robin time slicing.
use bitflags::bitflags;
use core::marker::PhantomData;

use crate::{
    error::BadContextError,
    hook,
    hook::api_assert,
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    readyqueue::Queue,
    thread::{self, ThreadCb, ThreadEntry, ThreadSt},
    utils::Init,
    KernelCfg, KernelTraits, System,
};

bitflags! {
    /// The scheduler state word. The running state is the empty set; `ISR`
    /// and `LOCK` combine bitwise while an interrupt handler runs inside a
    /// scheduler-locked region.
    pub struct SchedState: u8 {
        /// Servicing an interrupt.
        const ISR = 1 << 0;
        /// Preemption is deferred.
        const LOCK = 1 << 1;
        /// Parked in a low-power wait.
        const SLEEP = 1 << 2;
        /// `init` ran, `start` did not yet.
        const INIT = 1 << 3;
        /// Kernel data structures are not initialized.
        const INACTIVE = 1 << 4;
    }
}

impl Init for SchedState {
    const INIT: Self = Self::INACTIVE;
}

/// A copy of the scheduler's bookkeeping, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedSnapshot {
    pub state: SchedState,
    pub lock_depth: u8,
    pub isr_depth: u8,
}

/// The scheduler context. Exactly one instance exists per system, inside
/// [`KernelState`](crate::KernelState).
pub(crate) struct SchedCtx<Traits: KernelCfg> {
    /// The thread whose stack is loaded in the CPU. `None` only before the
    /// first dispatch.
    pub(crate) current: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,

    /// The thread that should run next. Equal to `current` when no switch
    /// is due; equal to the ready queue's front after every operation that
    /// modifies the ready queue.
    pub(crate) pending: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,

    pub(crate) state: CpuLockCell<Traits, SchedState>,

    /// Nesting count of scheduler-lock acquisitions.
    pub(crate) lock_depth: CpuLockCell<Traits, u8>,

    /// Nesting count of interrupt handlers.
    pub(crate) isr_depth: CpuLockCell<Traits, u8>,
}

impl<Traits: KernelCfg> Init for SchedCtx<Traits> {
    const INIT: Self = Self {
        current: Init::INIT,
        pending: Init::INIT,
        state: Init::INIT,
        lock_depth: Init::INIT,
        isr_depth: Init::INIT,
    };
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}

/// Read the scheduler state word.
#[inline]
pub(crate) fn state_of<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) -> SchedState {
    Traits::state().sched.state.get(&*lock)
}

/// Recompute `pending` from the ready queue. Called after every operation
/// that modifies the ready queue.
pub(crate) fn evaluate<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let front = Traits::state().run_queue.front(lock.borrow_mut());
    Traits::state().sched.pending.replace(&mut *lock, front);
}

/// Insert a thread into the ready queue and update `pending`.
pub(crate) fn insert_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    Traits::state().run_queue.insert(lock.borrow_mut(), thread);
    evaluate(lock);
}

/// Remove a thread from the ready queue and update `pending`.
pub(crate) fn remove_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    Traits::state().run_queue.remove(lock.borrow_mut(), thread);
    evaluate(lock);
}

/// Relinquish the CPU lock. After that, if the scheduler is in the running
/// state and a different thread is pending, ask the port to switch.
///
/// Kernel services that changed the ready queue call this before returning
/// to the caller.
pub(crate) fn unlock_and_reschedule<Traits: KernelTraits>(lock: CpuLockGuard<Traits>) {
    let sched = &Traits::state().sched;
    let state = sched.state.get(&*lock);
    let current = ptr_from_option_ref(sched.current.get(&*lock));
    let pending = ptr_from_option_ref(sched.pending.get(&*lock));
    let switch_needed = state.is_empty() && current != pending;

    drop(lock);

    if switch_needed {
        // Safety: CPU lock inactive
        unsafe { Traits::dispatch() };
    }
}

/// Acquire the CPU lock on an ISR-side entry path. These paths run below
/// the `ISR_MAX_PRIORITY` mask threshold, so finding the lock taken means
/// the caller broke the port contract.
pub(crate) fn isr_lock<Traits: KernelTraits>() -> CpuLockGuard<Traits> {
    match klock::lock_cpu() {
        Ok(lock) => lock,
        Err(_) => hook::assert_failed::<Traits>(
            module_path!(),
            file!(),
            line!(),
            "!Traits::is_cpu_lock_active()",
            "kernel entered from an interrupt while the CPU lock is active",
        ),
    }
}

/// The body of [`PortToKernel::isr_enter`](crate::PortToKernel::isr_enter).
pub(crate) fn isr_enter_body<Traits: KernelTraits>() {
    let mut lock = isr_lock::<Traits>();
    let sched = &Traits::state().sched;

    api_assert!(
        Traits,
        !state_of(lock.borrow_mut()).intersects(SchedState::INIT | SchedState::INACTIVE),
        "interrupts may not call kernel services before start",
    );

    let state = sched.state.get(&*lock);
    sched.state.replace(&mut *lock, state | SchedState::ISR);
    let depth = sched.isr_depth.get(&*lock);
    api_assert!(Traits, depth < u8::MAX, "ISR nesting too deep");
    sched.isr_depth.replace(&mut *lock, depth.wrapping_add(1));
}

/// The body of [`PortToKernel::isr_exit`](crate::PortToKernel::isr_exit).
///
/// Only the outermost exit evaluates `current` against `pending`; a switch
/// demanded by any nesting level is performed exactly once, through the
/// port's deferred dispatch mechanism.
pub(crate) fn isr_exit_body<Traits: KernelTraits>() {
    let mut lock = isr_lock::<Traits>();
    let sched = &Traits::state().sched;

    let depth = sched.isr_depth.get(&*lock);
    api_assert!(Traits, depth > 0, "isr_exit without a matching isr_enter");
    let depth = depth.wrapping_sub(1);
    sched.isr_depth.replace(&mut *lock, depth);

    if depth > 0 {
        return;
    }

    let mut state = sched.state.get(&*lock);
    state.remove(SchedState::ISR);

    let current = ptr_from_option_ref(sched.current.get(&*lock));
    let pending = ptr_from_option_ref(sched.pending.get(&*lock));
    let switch_needed = current != pending;

    #[cfg(feature = "power_save")]
    if switch_needed && state.contains(SchedState::SLEEP) {
        // Wake the sleeping scheduler; the sleep loop observes the change.
        state.remove(SchedState::SLEEP);
    }

    sched.state.replace(&mut *lock, state);

    let dispatch = switch_needed && !state.contains(SchedState::LOCK);
    drop(lock);

    if dispatch {
        // Safety: called from the outermost interrupt handler epilogue
        unsafe { Traits::pend_dispatch() };
    }
}

/// The body of
/// [`PortToKernel::complete_context_switch`](crate::PortToKernel::complete_context_switch):
/// retarget `current` at the pending thread and fire the context switch
/// hook.
pub(crate) fn complete_context_switch_body<Traits: KernelTraits>() {
    let mut lock = isr_lock::<Traits>();
    let sched = &Traits::state().sched;

    let current = sched.current.get(&*lock);
    let pending = sched.pending.get(&*lock);

    if ptr_from_option_ref(current) != ptr_from_option_ref(pending) {
        if let Some(to) = pending {
            hook::at_context_switch::<Traits>(current, to);
        }
        sched.current.replace(&mut *lock, pending);
    }
}

/// Round-robin bookkeeping, run on every tick.
///
/// The current thread's quantum counts down unless the scheduler is locked.
/// On exhaustion the counter reloads and the thread's priority class
/// rotates, which updates `pending` when no higher-priority thread was
/// already pending.
pub(crate) fn quantum_tick<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    if Traits::TIME_QUANTUM == 0 {
        return;
    }

    let sched = &Traits::state().sched;
    if sched.state.get(&*lock).contains(SchedState::LOCK) {
        return;
    }

    let Some(current) = sched.current.get(&*lock) else {
        return;
    };
    if current.st.get(&*lock) != ThreadSt::Ready {
        // The current thread blocked inside this tick's ISR; its slice
        // accounting resumes when it is readied again.
        return;
    }

    let quantum = current.quantum.get(&*lock).saturating_sub(1);
    if quantum > 0 {
        current.quantum.replace(&mut *lock, quantum);
        return;
    }

    let reload = current.quantum_reload.get(&*lock);
    current.quantum.replace(&mut *lock, reload);

    let priority = current.prio.get(&*lock);
    Traits::state().run_queue.rotate(lock.borrow_mut(), priority);
    evaluate(lock);
}

/// The idle thread. Occupies reserved priority 0 so the ready queue is
/// never empty once the kernel is initialized.
fn idle_entry<Traits: KernelTraits>(_param: usize) {
    loop {
        hook::at_idle_enter::<Traits>();
        // Safety: thread context, CPU lock inactive
        unsafe { Traits::wait_for_interrupt() };
        hook::at_idle_exit::<Traits>();
    }
}

/// A witness of one interrupt-critical-section acquisition, holding the
/// previous interrupt mask inside the port. Returned by
/// [`System::critical_enter`] and consumed by [`System::critical_exit`].
pub struct CriticalToken<Traits> {
    _phantom: PhantomData<Traits>,
}

/// These associated functions implement the kernel lifecycle API.
impl<Traits: KernelTraits> System<Traits> {
    /// Initialize the kernel. May be called only once.
    ///
    /// Builds the ready queue and creates the internal idle thread at
    /// reserved priority 0.
    pub fn init() -> Result<(), BadContextError> {
        api_assert!(
            Traits,
            Traits::PRIORITY_LEVELS >= 3
                && Traits::PRIORITY_LEVELS <= crate::utils::PRIO_BITMAP_LEN,
            "PRIORITY_LEVELS must be in 3..=256",
        );
        api_assert!(
            Traits,
            <Traits::ThreadQueue as Queue<Traits>>::LEVELS == Traits::PRIORITY_LEVELS,
            "ready queue instantiated for a different level count",
        );
        api_assert!(
            Traits,
            <Traits::ThreadQueue as Queue<Traits>>::BUCKETS.is_power_of_two()
                && <Traits::ThreadQueue as Queue<Traits>>::BUCKETS <= Traits::PRIORITY_LEVELS,
            "PRIORITY_BUCKETS must be a power of two not exceeding PRIORITY_LEVELS",
        );
        api_assert!(
            Traits,
            Traits::idle_stack().len >= Traits::STACK_MIN_SIZE,
            "idle stack is smaller than the port minimum",
        );

        let mut lock = klock::lock_cpu::<Traits>()?;
        api_assert!(
            Traits,
            state_of(lock.borrow_mut()).contains(SchedState::INACTIVE),
            "init may be called only once",
        );

        Traits::state()
            .sched
            .state
            .replace(&mut *lock, SchedState::INIT);

        thread::init_thread(
            lock.borrow_mut(),
            Traits::idle_thread(),
            ThreadEntry {
                entry: idle_entry::<Traits>,
                param: 0,
            },
            Traits::idle_stack(),
            0,
        );

        hook::at_kernel_init::<Traits>();
        Ok(())
    }

    /// Pick the highest-priority ready thread and dispatch to it. Does not
    /// return.
    pub fn start() -> ! {
        // If the CPU lock is inactive, activate it. The port's first
        // dispatch reclaims it.
        let mut lock = unsafe {
            if !Traits::is_cpu_lock_active() {
                Traits::enter_cpu_lock();
            }
            klock::assume_cpu_lock::<Traits>()
        };

        api_assert!(
            Traits,
            state_of(lock.borrow_mut()) == SchedState::INIT,
            "start requires an initialized, not yet started kernel",
        );

        let sched = &Traits::state().sched;
        let Some(first) = Traits::state().run_queue.front(lock.borrow_mut()) else {
            hook::assert_failed::<Traits>(
                module_path!(),
                file!(),
                line!(),
                "run_queue.front().is_some()",
                "start called on an uninitialized kernel",
            )
        };

        sched.pending.replace(&mut *lock, Some(first));
        sched.current.replace(&mut *lock, Some(first));
        sched.state.replace(&mut *lock, SchedState::empty());

        hook::at_kernel_start::<Traits>();
        hook::at_context_switch::<Traits>(None, first);

        core::mem::forget(lock);

        // Safety: CPU lock active; the port installs `first`'s stack and
        // enters thread mode
        unsafe { Traits::dispatch_first_thread() }
    }

    /// Enter a scheduler-locked region. Nestable. While locked, pending
    /// thread changes are recorded but dispatch is deferred until the
    /// outermost [`lock_exit`](Self::lock_exit).
    pub fn lock_enter() -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let sched = &Traits::state().sched;

        api_assert!(
            Traits,
            !state_of(lock.borrow_mut()).intersects(SchedState::INIT | SchedState::INACTIVE),
            "scheduler is not running",
        );

        let depth = sched.lock_depth.get(&*lock);
        api_assert!(Traits, depth < u8::MAX, "scheduler lock nesting too deep");

        let state = sched.state.get(&*lock);
        sched.state.replace(&mut *lock, state | SchedState::LOCK);
        sched.lock_depth.replace(&mut *lock, depth.wrapping_add(1));
        Ok(())
    }

    /// Leave a scheduler-locked region. The outermost exit performs any
    /// dispatch that was deferred while the lock was held.
    pub fn lock_exit() -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let sched = &Traits::state().sched;

        let depth = sched.lock_depth.get(&*lock);
        api_assert!(
            Traits,
            depth > 0 && sched.state.get(&*lock).contains(SchedState::LOCK),
            "scheduler is not locked",
        );

        let depth = depth.wrapping_sub(1);
        sched.lock_depth.replace(&mut *lock, depth);

        if depth == 0 {
            let mut state = sched.state.get(&*lock);
            state.remove(SchedState::LOCK);
            sched.state.replace(&mut *lock, state);
            unlock_and_reschedule(lock);
        }
        Ok(())
    }

    /// Enter an interrupt critical section: raise the interrupt mask to the
    /// scheduler threshold and return a token holding the previous mask.
    ///
    /// Kernel services may not be called while the token is live; they
    /// would find the CPU lock taken and fail with `BadContext`.
    pub fn critical_enter() -> Result<CriticalToken<Traits>, BadContextError> {
        // Safety: balanced by `critical_exit` consuming the token
        if unsafe { Traits::try_enter_cpu_lock() } {
            Ok(CriticalToken {
                _phantom: PhantomData,
            })
        } else {
            Err(BadContextError::BadContext)
        }
    }

    /// Leave an interrupt critical section, restoring the interrupt mask
    /// the matching [`critical_enter`](Self::critical_enter) saved.
    pub fn critical_exit(token: CriticalToken<Traits>) {
        let _ = token;
        // Safety: the token witnesses an unreleased acquisition
        unsafe { Traits::leave_cpu_lock() };
    }

    /// Get a copy of the scheduler's bookkeeping for diagnostics.
    pub fn sched_snapshot() -> Result<SchedSnapshot, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let sched = &Traits::state().sched;
        Ok(SchedSnapshot {
            state: sched.state.get(&*lock),
            lock_depth: sched.lock_depth.get(&*lock),
            isr_depth: sched.isr_depth.get(&*lock),
        })
    }

    /// Get the thread the scheduler has decided should run next.
    pub fn pending_thread() -> Result<Option<&'static ThreadCb<Traits>>, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(Traits::state().sched.pending.get(&*lock))
    }

    /// Park the scheduler in a low-power wait until an interrupt makes a
    /// different thread pending.
    #[cfg(feature = "power_save")]
    pub fn sleep() -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let sched = &Traits::state().sched;

        api_assert!(
            Traits,
            state_of(lock.borrow_mut()).is_empty(),
            "sleep requires a running, unlocked scheduler outside interrupts",
        );

        hook::at_idle_enter::<Traits>();
        let state = sched.state.get(&*lock);
        sched.state.replace(&mut *lock, state | SchedState::SLEEP);

        loop {
            let current = ptr_from_option_ref(sched.current.get(&*lock));
            let pending = ptr_from_option_ref(sched.pending.get(&*lock));
            if current != pending {
                break;
            }

            drop(lock);
            // Safety: thread context, CPU lock inactive
            unsafe { Traits::wait_for_interrupt() };
            lock = klock::lock_cpu::<Traits>()?;

            if !sched.state.get(&*lock).contains(SchedState::SLEEP) {
                // An interrupt already woke the scheduler.
                break;
            }
        }

        let mut state = sched.state.get(&*lock);
        state.remove(SchedState::SLEEP);
        sched.state.replace(&mut *lock, state);
        hook::at_idle_exit::<Traits>();

        unlock_and_reschedule(lock);
        Ok(())
    }
}
