//! Threads.
use core::{cell::UnsafeCell, fmt, mem::MaybeUninit};

use crate::{
    error::{BadContextError, WaitError},
    hook,
    hook::api_assert,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    readyqueue::{Queue as _, ThreadRef},
    sched,
    semaphore::SemaphoreRef,
    utils::{Init, Link},
    KernelCfg, KernelTraits, Priority, Quantum, System,
};

/// Signature value stamped into a live [`ThreadCb`]. Inverted on
/// termination so stale handles are recognizable in a debugger.
pub(crate) const THREAD_SIGNATURE: usize = 0x5254_4844;

/// The entry point of a thread together with its opaque argument, as handed
/// to the port's stack frame builder.
#[derive(Clone, Copy)]
pub struct ThreadEntry {
    /// The function the first context restore into the thread lands at.
    pub entry: fn(usize),
    /// The value placed in the first-parameter register.
    pub param: usize,
}

impl fmt::Debug for ThreadEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadEntry")
            .field("entry", &(self.entry as *const ()))
            .field("param", &self.param)
            .finish()
    }
}

/// A caller-owned stack memory region, described to the kernel and the port
/// by its base address and length.
#[derive(Clone, Copy, Debug)]
pub struct StackRegion {
    /// The lowest address of the region.
    pub start: *mut u8,
    /// The region's length in bytes.
    pub len: usize,
}

// Safety: `StackRegion` is plain position data. The memory it describes is
// only ever touched by the owning thread and the port's context switcher.
unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

impl Init for StackRegion {
    const INIT: Self = Self {
        start: core::ptr::null_mut(),
        len: 0,
    };
}

/// Caller-owned backing storage for a thread stack, 8-byte aligned as
/// required by the port calling conventions.
#[repr(C)]
pub struct StackStorage<const N: usize> {
    _align: elain::Align<8>,
    storage: UnsafeCell<[MaybeUninit<u8>; N]>,
}

// Safety: the kernel never reads or writes the contents; only the port's
// context switcher does, and only on behalf of the one thread owning it.
unsafe impl<const N: usize> Sync for StackStorage<N> {}

impl<const N: usize> StackStorage<N> {
    pub const fn new() -> Self {
        Self {
            _align: elain::Align::NEW,
            storage: UnsafeCell::new([MaybeUninit::uninit(); N]),
        }
    }

    /// Describe the storage as a [`StackRegion`].
    pub fn region(&'static self) -> StackRegion {
        StackRegion {
            start: self.storage.get() as *mut u8,
            len: N,
        }
    }
}

impl<const N: usize> Init for StackStorage<N> {
    const INIT: Self = Self::new();
}

/// Thread state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadSt {
    /// Not initialized, or terminated.
    Dormant,
    /// Runnable and linked into the ready queue. The running thread is the
    /// `Ready` thread the scheduler context points at with `current`.
    Ready,
    /// Blocked; linked into a waiter queue, or into no queue at all while
    /// sleeping on a timer.
    Waiting,
}

impl Init for ThreadSt {
    const INIT: Self = Self::Dormant;
}

/// *Thread control block* - the state data of a thread.
///
/// The storage is caller-owned and must outlive the thread. The kernel
/// links it into its internal queues but never frees it.
#[repr(C)]
pub struct ThreadCb<Traits: KernelCfg> {
    /// The port's per-thread state (saved stack pointer and whatever else
    /// the context switcher needs).
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that assembly code can refer to it easily.
    pub port_thread_state: Traits::PortThreadState,

    /// Queue linkage. A thread is in at most one queue at any time: the
    /// ready queue while `Ready`, a waiter queue (or none) while `Waiting`.
    pub(crate) link: CpuLockCell<Traits, Option<Link<ThreadRef<Traits>>>>,

    /// Current priority.
    pub(crate) prio: CpuLockCell<Traits, Priority>,

    /// Original priority, preserved across temporary boosts.
    pub(crate) base_prio: CpuLockCell<Traits, Priority>,

    /// Ticks remaining in the current round-robin slice.
    /// Invariant: `quantum <= quantum_reload`.
    pub(crate) quantum: CpuLockCell<Traits, Quantum>,

    /// Slice length the quantum is reloaded from.
    pub(crate) quantum_reload: CpuLockCell<Traits, Quantum>,

    pub(crate) st: CpuLockCell<Traits, ThreadSt>,

    /// The result of the last wait operation, stored by the wake-upper and
    /// returned by the blocking call.
    pub(crate) wait_result: CpuLockCell<Traits, Result<(), WaitError>>,

    /// The semaphore whose waiter queue holds this thread, while it does.
    /// Names the queue the linkage belongs to so a wake-upper other than
    /// the owner (e.g. a timeout) can find it.
    pub(crate) blocked_on: CpuLockCell<Traits, Option<SemaphoreRef<Traits>>>,

    /// The thread's stack region. The saved stack pointer lies within it
    /// except while the thread is executing.
    pub(crate) stack: CpuLockCell<Traits, StackRegion>,

    pub(crate) signature: CpuLockCell<Traits, usize>,

    #[cfg(feature = "registry")]
    pub(crate) name: CpuLockCell<Traits, Option<&'static str>>,

    #[cfg(feature = "registry")]
    pub(crate) reg_next: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
}

impl<Traits: KernelCfg> ThreadCb<Traits> {
    /// A control block ready to be passed to
    /// [`thread_init`](crate::System::thread_init).
    pub const fn new() -> Self {
        <Self as Init>::INIT
    }
}

impl<Traits: KernelCfg> Init for ThreadCb<Traits> {
    const INIT: Self = Self {
        port_thread_state: Init::INIT,
        link: Init::INIT,
        prio: Init::INIT,
        base_prio: Init::INIT,
        quantum: Init::INIT,
        quantum_reload: Init::INIT,
        st: CpuLockCell::new(ThreadSt::Dormant),
        wait_result: CpuLockCell::new(Ok(())),
        blocked_on: Init::INIT,
        stack: Init::INIT,
        signature: Init::INIT,
        #[cfg(feature = "registry")]
        name: Init::INIT,
        #[cfg(feature = "registry")]
        reg_next: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for ThreadCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("port_thread_state", &self.port_thread_state)
            .field("prio", &self.prio)
            .field("st", &self.st)
            .finish_non_exhaustive()
    }
}

/// Initialize a thread control block and make the thread ready.
///
/// This is the common effect of the public thread creation API and the
/// internal idle thread; the caller is responsible for contract checks and
/// for the subsequent scheduling decision.
pub(crate) fn init_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    entry: ThreadEntry,
    stack: StackRegion,
    priority: Priority,
) {
    thread.prio.replace(&mut *lock, priority);
    thread.base_prio.replace(&mut *lock, priority);
    thread.quantum.replace(&mut *lock, Traits::TIME_QUANTUM);
    thread.quantum_reload.replace(&mut *lock, Traits::TIME_QUANTUM);
    thread.wait_result.replace(&mut *lock, Ok(()));
    thread.blocked_on.replace(&mut *lock, None);
    thread.link.replace(&mut *lock, None);
    thread.stack.replace(&mut *lock, stack);
    thread.signature.replace(&mut *lock, THREAD_SIGNATURE);

    // Safety: CPU lock active, and the thread is not running, so its stack
    // can be rewritten freely
    unsafe { Traits::initialize_thread_state(thread, entry, stack) };

    thread.st.replace(&mut *lock, ThreadSt::Ready);

    #[cfg(feature = "registry")]
    registry_insert(lock.borrow_mut(), thread);

    sched::insert_thread(lock, thread);
}

/// These associated functions implement the thread-related portion of the
/// kernel API.
impl<Traits: KernelTraits> System<Traits> {
    /// Initialize a thread and insert it into the ready queue.
    ///
    /// The first context restore into the thread enters `entry` with
    /// `param` in the first-parameter register and interrupts enabled. If
    /// the new thread outranks the caller, the caller is preempted before
    /// this function returns.
    pub fn thread_init<const N: usize>(
        thread: &'static ThreadCb<Traits>,
        entry: fn(usize),
        param: usize,
        stack: &'static StackStorage<N>,
        priority: Priority,
    ) -> Result<(), BadContextError> {
        api_assert!(
            Traits,
            (priority as usize) > 0 && (priority as usize) < Traits::PRIORITY_LEVELS - 1,
            "priorities 0 and PRIORITY_LEVELS - 1 are reserved",
        );
        api_assert!(
            Traits,
            N >= Traits::STACK_MIN_SIZE,
            "stack is smaller than the port minimum",
        );

        let mut lock = klock::lock_cpu::<Traits>()?;
        api_assert!(
            Traits,
            !sched::state_of(lock.borrow_mut()).contains(crate::SchedState::INACTIVE),
            "kernel is not initialized",
        );
        api_assert!(
            Traits,
            thread.signature.get(&*lock) != THREAD_SIGNATURE,
            "thread is already initialized",
        );

        init_thread(
            lock.borrow_mut(),
            thread,
            ThreadEntry { entry, param },
            stack.region(),
            priority,
        );

        hook::at_thread_init::<Traits>(thread);

        sched::unlock_and_reschedule(lock);
        Ok(())
    }

    /// Terminate the calling thread. Does not return.
    ///
    /// The thread is removed from the ready queue, its control block is
    /// invalidated, and the processor is handed to the next pending thread.
    pub fn thread_term() -> ! {
        // If the CPU lock is inactive, activate it. The final dispatch
        // happens with the lock held; the port reclaims it.
        let mut lock = unsafe {
            if !Traits::is_cpu_lock_active() {
                Traits::enter_cpu_lock();
            }
            klock::assume_cpu_lock::<Traits>()
        };

        let Some(current) = Traits::state().sched.current.get(&*lock) else {
            hook::assert_failed::<Traits>(
                module_path!(),
                file!(),
                line!(),
                "current.is_some()",
                "thread_term requires a running thread",
            )
        };

        hook::at_thread_term::<Traits>(current);

        #[cfg(feature = "registry")]
        registry_remove(lock.borrow_mut(), current);

        sched::remove_thread(lock.borrow_mut(), current);
        current.st.replace(&mut *lock, ThreadSt::Dormant);
        current.signature.replace(&mut *lock, !THREAD_SIGNATURE);

        core::mem::forget(lock);

        // Safety: CPU lock active; the stack of `current` is dead from this
        // point on and the port may discard it
        unsafe { Traits::exit_and_dispatch(current) }
    }

    /// Get the currently running thread.
    ///
    /// Returns `BadContext` before the kernel has dispatched its first
    /// thread.
    pub fn thread_get_current() -> Result<&'static ThreadCb<Traits>, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Traits::state()
            .sched
            .current
            .get(&*lock)
            .ok_or(BadContextError::BadContext)
    }

    /// Get a thread's current priority.
    pub fn thread_get_priority(
        thread: &'static ThreadCb<Traits>,
    ) -> Result<Priority, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        api_assert!(
            Traits,
            thread.signature.get(&*lock) == THREAD_SIGNATURE,
            "thread is not initialized",
        );
        Ok(thread.prio.get(&*lock))
    }

    /// Set a thread's priority. The change is immediate and unconditional;
    /// no inheritance protocol is applied, and the thread's remaining
    /// round-robin slice is left untouched.
    ///
    /// If the caller lowers itself below another ready thread, it yields to
    /// that thread before this function returns.
    pub fn thread_set_priority(
        thread: &'static ThreadCb<Traits>,
        priority: Priority,
    ) -> Result<(), BadContextError> {
        api_assert!(
            Traits,
            (priority as usize) > 0 && (priority as usize) < Traits::PRIORITY_LEVELS - 1,
            "priorities 0 and PRIORITY_LEVELS - 1 are reserved",
        );

        let mut lock = klock::lock_cpu::<Traits>()?;
        api_assert!(
            Traits,
            thread.signature.get(&*lock) == THREAD_SIGNATURE,
            "thread is not initialized",
        );
        api_assert!(
            Traits,
            thread.st.get(&*lock) != ThreadSt::Dormant,
            "thread is dormant",
        );

        if thread.prio.get(&*lock) == priority {
            return Ok(());
        }

        match thread.st.get(&*lock) {
            ThreadSt::Ready => {
                // Reposition within the ready queue under the new priority.
                Traits::state().run_queue.remove(lock.borrow_mut(), thread);
                thread.prio.replace(&mut *lock, priority);
                thread.base_prio.replace(&mut *lock, priority);
                Traits::state().run_queue.insert(lock.borrow_mut(), thread);
                sched::evaluate(lock.borrow_mut());
                sched::unlock_and_reschedule(lock);
            }
            ThreadSt::Waiting => {
                // Waiter queues are priority-ordered too.
                crate::semaphore::reorder_waiter(lock.borrow_mut(), thread, priority);
            }
            ThreadSt::Dormant => {}
        }

        Ok(())
    }
}

#[cfg(feature = "registry")]
pub(crate) fn registry_insert<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    use crate::utils::Ident;
    let head = Traits::state().registry.get(&*lock);
    thread.reg_next.replace(&mut *lock, head);
    Traits::state()
        .registry
        .replace(&mut *lock, Some(Ident(thread)));
}

#[cfg(feature = "registry")]
pub(crate) fn registry_remove<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    use crate::utils::Ident;
    let mut cursor = Traits::state().registry.get(&*lock);
    if cursor == Some(Ident(thread)) {
        let next = thread.reg_next.get(&*lock);
        Traits::state().registry.replace(&mut *lock, next);
        return;
    }
    while let Some(node) = cursor {
        let next = node.0.reg_next.get(&*lock);
        if next == Some(Ident(thread)) {
            let skip = thread.reg_next.get(&*lock);
            node.0.reg_next.replace(&mut *lock, skip);
            return;
        }
        cursor = next;
    }
}

#[cfg(feature = "registry")]
/// Thread name tracking and enumeration.
impl<Traits: KernelTraits> System<Traits> {
    /// Attach a name to a thread for diagnostics.
    pub fn thread_set_name(
        thread: &'static ThreadCb<Traits>,
        name: &'static str,
    ) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        thread.name.replace(&mut *lock, Some(name));
        Ok(())
    }

    /// Get the name attached to a thread, if any.
    pub fn thread_name(
        thread: &'static ThreadCb<Traits>,
    ) -> Result<Option<&'static str>, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(thread.name.get(&*lock))
    }

    /// Call `f` for every live thread, including the idle thread.
    pub fn for_each_thread(
        mut f: impl FnMut(&'static ThreadCb<Traits>),
    ) -> Result<(), BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        let mut cursor = Traits::state().registry.get(&*lock);
        while let Some(node) = cursor {
            f(node.0);
            cursor = node.0.reg_next.get(&*lock);
        }
        Ok(())
    }
}
