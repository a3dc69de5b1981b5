//! Virtual timers and the system clock.
//!
//! Armed timers form a doubly-linked list ordered by expiry. Each node
//! holds a tick count *relative to its predecessor's expiry*; the head's
//! count is relative to now. The tick handler therefore only ever touches
//! the head (constant time per tick), while arming walks the list summing
//! deltas (linear in the number of armed timers).
//!
//! Coincident expirations sit in the list as zero-delta successors and fire
//! in their insertion order.
//!
//! Callbacks run in interrupt context with the CPU lock released, so they
//! may call the interrupt-safe kernel services (such as
//! [`System::sem_signal`]) but must never block.
use core::{fmt, ptr::NonNull};

use crate::{
    error::{BadContextError, WaitError},
    hook,
    hook::{api_assert, internal_assert},
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    sched,
    thread::{ThreadCb, ThreadSt},
    utils::{Init, Link, ListHead},
    KernelCfg, KernelTraits, System, TickCount, Ticks,
};

pub(crate) const TIMER_SIGNATURE: usize = 0x5254_4d52;

/// A timer callback: a bare function pointer with an opaque argument. The
/// argument's pointee, if any, must outlive the arming.
pub type TimerFn = fn(usize);

/// A reference to a [`TimerCb`].
///
/// Unlike thread and semaphore handles, timer storage may live on a blocked
/// caller's stack, so list linkage uses raw pointers. Every element is
/// unlinked before its storage is invalidated: expiry unlinks, cancellation
/// unlinks, and the blocking primitives cancel before leaving the frame.
pub(crate) struct TimerRef<Traits: KernelCfg>(NonNull<TimerCb<Traits>>);

// Safety: `TimerCb` is `Send + Sync`
unsafe impl<Traits: KernelCfg> Send for TimerRef<Traits> {}
unsafe impl<Traits: KernelCfg> Sync for TimerRef<Traits> {}

impl<Traits: KernelCfg> Clone for TimerRef<Traits> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelCfg> Copy for TimerRef<Traits> {}

impl<Traits: KernelCfg> PartialEq for TimerRef<Traits> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: KernelCfg> Eq for TimerRef<Traits> {}

impl<Traits: KernelCfg> fmt::Debug for TimerRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TimerRef").field(&self.0).finish()
    }
}

impl<Traits: KernelCfg> TimerRef<Traits> {
    #[inline]
    fn new(timer: &TimerCb<Traits>) -> Self {
        Self(NonNull::from(timer))
    }
}

/// Dereference a list element.
///
/// All elements of the timer list are extant (see [`TimerRef`]), which is
/// what justifies the pointer dereference.
#[inline]
fn timer_cb<'a, Traits: KernelCfg>(r: TimerRef<Traits>) -> &'a TimerCb<Traits> {
    unsafe { &*r.0.as_ptr() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerSt {
    Idle,
    Armed,
}

impl Init for TimerSt {
    const INIT: Self = Self::Idle;
}

/// *Virtual timer control block* - the state data of a one-shot software
/// timer driven by the periodic tick.
pub struct TimerCb<Traits: KernelCfg> {
    pub(crate) link: CpuLockCell<Traits, Option<Link<TimerRef<Traits>>>>,

    /// Ticks remaining relative to the predecessor's expiry (relative to
    /// now for the head element).
    pub(crate) rtick: CpuLockCell<Traits, Ticks>,

    pub(crate) callback: CpuLockCell<Traits, Option<TimerFn>>,
    pub(crate) param: CpuLockCell<Traits, usize>,
    pub(crate) st: CpuLockCell<Traits, TimerSt>,
    pub(crate) signature: CpuLockCell<Traits, usize>,
}

impl<Traits: KernelCfg> TimerCb<Traits> {
    /// A control block ready to be passed to
    /// [`timer_arm`](crate::System::timer_arm).
    pub const fn new() -> Self {
        <Self as Init>::INIT
    }
}

impl<Traits: KernelCfg> Init for TimerCb<Traits> {
    const INIT: Self = Self {
        link: Init::INIT,
        rtick: Init::INIT,
        callback: Init::INIT,
        param: Init::INIT,
        st: CpuLockCell::new(TimerSt::Idle),
        signature: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("rtick", &self.rtick)
            .field("st", &self.st)
            .finish_non_exhaustive()
    }
}

/// Kernel-global timed event state.
pub(crate) struct TimeoutGlobals<Traits: KernelCfg> {
    /// The delta-ordered timer list.
    pub(crate) timers: CpuLockCell<Traits, ListHead<TimerRef<Traits>>>,

    /// Ticks elapsed since `start`.
    pub(crate) tick_count: CpuLockCell<Traits, TickCount>,
}

impl<Traits: KernelCfg> Init for TimeoutGlobals<Traits> {
    const INIT: Self = Self {
        timers: Init::INIT,
        tick_count: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for TimeoutGlobals<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutGlobals")
            .field("tick_count", &self.tick_count)
            .finish_non_exhaustive()
    }
}

#[inline]
fn link_of<Traits: KernelCfg>(
    lock: &CpuLockTokenRefMut<'_, Traits>,
    r: TimerRef<Traits>,
) -> Link<TimerRef<Traits>> {
    match timer_cb(r).link.get(&**lock) {
        Some(link) => link,
        // A timer reachable from the list is always linked.
        None => unreachable!(),
    }
}

#[inline]
fn set_next<Traits: KernelCfg>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
    r: TimerRef<Traits>,
    value: TimerRef<Traits>,
) {
    let mut l = link_of(lock, r);
    l.next = value;
    timer_cb(r).link.replace(&mut **lock, Some(l));
}

#[inline]
fn set_prev<Traits: KernelCfg>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
    r: TimerRef<Traits>,
    value: TimerRef<Traits>,
) {
    let mut l = link_of(lock, r);
    l.prev = value;
    timer_cb(r).link.replace(&mut **lock, Some(l));
}

/// Link `r` into the cycle right before `at`.
fn insert_before<Traits: KernelTraits>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
    at: TimerRef<Traits>,
    r: TimerRef<Traits>,
) {
    let prev = link_of(lock, at).prev;
    timer_cb(r)
        .link
        .replace(&mut **lock, Some(Link { prev, next: at }));
    set_next(lock, prev, r);
    set_prev(lock, at, r);
}

/// Arm `timer` to expire `ticks` ticks from now.
///
/// The timer storage must stay in place and valid until the timer expires
/// or is cancelled. The public API guarantees this with `'static` handles;
/// the blocking primitives guarantee it by cancelling before the owning
/// stack frame is left.
pub(crate) fn arm_at<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer: &TimerCb<Traits>,
    ticks: Ticks,
    callback: TimerFn,
    param: usize,
) {
    internal_assert!(
        Traits,
        timer.st.get(&*lock) == TimerSt::Idle && timer.link.get(&*lock).is_none(),
        "timer is already armed",
    );

    timer.callback.replace(&mut *lock, Some(callback));
    timer.param.replace(&mut *lock, param);
    timer.st.replace(&mut *lock, TimerSt::Armed);
    timer.signature.replace(&mut *lock, TIMER_SIGNATURE);

    let globals = &Traits::state().timeouts;
    let r = TimerRef::new(timer);
    let mut remaining = ticks;

    let Some(first) = globals.timers.get(&*lock).first else {
        timer.rtick.replace(&mut *lock, remaining);
        timer
            .link
            .replace(&mut *lock, Some(Link { prev: r, next: r }));
        globals
            .timers
            .replace(&mut *lock, ListHead { first: Some(r) });
        return;
    };

    // Walk forward summing deltas. The new timer goes in front of the
    // first element whose cumulative expiry exceeds it; an element with an
    // equal expiry is passed over, so coincident timers keep insertion
    // order.
    let mut cursor = first;
    loop {
        let delta = timer_cb(cursor).rtick.get(&*lock);
        if delta <= remaining {
            remaining -= delta;
            let next = link_of(&lock, cursor).next;
            if next == first {
                // Expires last; append at the tail.
                timer.rtick.replace(&mut *lock, remaining);
                insert_before(&mut lock, first, r);
                return;
            }
            cursor = next;
        } else {
            // Expires before `cursor`; take a share of its delta.
            timer.rtick.replace(&mut *lock, remaining);
            timer_cb(cursor).rtick.replace(&mut *lock, delta - remaining);
            insert_before(&mut lock, cursor, r);
            if cursor == first {
                globals
                    .timers
                    .replace(&mut *lock, ListHead { first: Some(r) });
            }
            return;
        }
    }
}

/// Disarm `timer` if it is armed. Its remaining delta is returned to the
/// successor so later expiries are unaffected.
pub(crate) fn cancel_if_armed<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer: &TimerCb<Traits>,
) {
    if timer.st.get(&*lock) != TimerSt::Armed {
        return;
    }

    let globals = &Traits::state().timeouts;
    let r = TimerRef::new(timer);
    let l = link_of(&lock, r);

    let Some(first) = globals.timers.get(&*lock).first else {
        // An armed timer is always in the list.
        unreachable!()
    };

    if l.next == r {
        // Sole element.
        globals.timers.replace(&mut *lock, ListHead { first: None });
    } else {
        if l.next != first {
            // A true successor follows; give it our remaining ticks.
            let succ = timer_cb(l.next);
            let delta = succ.rtick.get(&*lock);
            let own = timer.rtick.get(&*lock);
            succ.rtick.replace(&mut *lock, delta + own);
        }
        set_next(&mut lock, l.prev, l.next);
        set_prev(&mut lock, l.next, l.prev);
        if first == r {
            globals
                .timers
                .replace(&mut *lock, ListHead { first: Some(l.next) });
        }
    }

    timer.link.replace(&mut *lock, None);
    timer.st.replace(&mut *lock, TimerSt::Idle);
}

/// Unlink the head element, returning it.
fn pop_front<Traits: KernelTraits>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
) -> Option<TimerRef<Traits>> {
    let globals = &Traits::state().timeouts;
    let first = globals.timers.get(&**lock).first?;
    let l = link_of(lock, first);

    if l.next == first {
        globals.timers.replace(&mut **lock, ListHead { first: None });
    } else {
        set_next(lock, l.prev, l.next);
        set_prev(lock, l.next, l.prev);
        globals
            .timers
            .replace(&mut **lock, ListHead { first: Some(l.next) });
    }

    let cb = timer_cb(first);
    cb.link.replace(&mut **lock, None);
    cb.st.replace(&mut **lock, TimerSt::Idle);
    Some(first)
}

/// Advance the timer list by one tick and fire every expired timer, in
/// order. Part of the tick interrupt; the guard is released around each
/// callback invocation and re-acquired afterwards.
pub(crate) fn handle_tick<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    let globals = &Traits::state().timeouts;

    let count = globals.tick_count.get(&*lock);
    globals.tick_count.replace(&mut *lock, count.wrapping_add(1));

    {
        let Some(first) = globals.timers.get(&*lock).first else {
            return lock;
        };
        let cb = timer_cb(first);
        let delta = cb.rtick.get(&*lock);
        internal_assert!(Traits, delta > 0, "zero delta left in the timer list");
        cb.rtick.replace(&mut *lock, delta.saturating_sub(1));
    }

    loop {
        let Some(first) = globals.timers.get(&*lock).first else {
            return lock;
        };
        let cb = timer_cb(first);
        if cb.rtick.get(&*lock) != 0 {
            return lock;
        }

        let callback = cb.callback.get(&*lock);
        let param = cb.param.get(&*lock);
        pop_front(&mut lock.borrow_mut());

        if let Some(callback) = callback {
            drop(lock);
            callback(param);
            lock = sched::isr_lock::<Traits>();
        }
    }
}

/// The timer expiry callback of [`System::thread_delay`]. Runs in
/// interrupt context with the CPU lock inactive; `param` is the delayed
/// thread.
fn wake_delayed<Traits: KernelTraits>(param: usize) {
    // Safety: converting back the pointer `thread_delay` armed us with; the
    // thread control block is `'static`
    let thread = unsafe { &*(param as *const ThreadCb<Traits>) };

    let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
        return;
    };

    if thread.st.get(&*lock) != ThreadSt::Waiting {
        return;
    }

    thread.wait_result.replace(&mut *lock, Ok(()));
    thread.st.replace(&mut *lock, ThreadSt::Ready);
    sched::insert_thread(lock.borrow_mut(), thread);
}

/// These associated functions implement the timer API.
impl<Traits: KernelTraits> System<Traits> {
    /// Arm a one-shot timer to call `callback(param)` `ticks` ticks from
    /// now, in interrupt context.
    pub fn timer_arm(
        timer: &'static TimerCb<Traits>,
        ticks: Ticks,
        callback: TimerFn,
        param: usize,
    ) -> Result<(), BadContextError> {
        api_assert!(Traits, ticks > 0, "expiry must be at least one tick away");

        let mut lock = klock::lock_cpu::<Traits>()?;
        api_assert!(
            Traits,
            timer.st.get(&*lock) == TimerSt::Idle,
            "timer is already armed",
        );

        arm_at(lock.borrow_mut(), timer, ticks, callback, param);
        Ok(())
    }

    /// Cancel a timer. Cancelling an idle timer is a no-op; later timers
    /// keep their expiry times either way.
    pub fn timer_cancel(timer: &'static TimerCb<Traits>) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        cancel_if_armed(lock.borrow_mut(), timer);
        Ok(())
    }

    /// Check whether a timer is armed and counting down.
    pub fn timer_is_armed(timer: &'static TimerCb<Traits>) -> Result<bool, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(timer.st.get(&*lock) == TimerSt::Armed)
    }

    /// Ticks elapsed since the kernel started.
    pub fn tick_now() -> Result<TickCount, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(Traits::state().timeouts.tick_count.get(&*lock))
    }

    /// Block the calling thread for `ticks` system ticks.
    pub fn thread_delay(ticks: Ticks) -> Result<(), WaitError> {
        api_assert!(Traits, ticks > 0, "delay must be at least one tick");

        let mut lock = klock::lock_cpu::<Traits>()?;
        api_assert!(
            Traits,
            sched::state_of(lock.borrow_mut()).is_empty(),
            "thread_delay may only block from an unlocked thread context",
        );

        let Some(current) = Traits::state().sched.current.get(&*lock) else {
            hook::assert_failed::<Traits>(
                module_path!(),
                file!(),
                line!(),
                "current.is_some()",
                "thread_delay requires a running thread",
            )
        };

        // The timeout object lives on the blocked caller's stack; expiry
        // unlinks it before the caller resumes.
        let timer: TimerCb<Traits> = Init::INIT;
        arm_at(
            lock.borrow_mut(),
            &timer,
            ticks,
            wake_delayed::<Traits>,
            current as *const _ as usize,
        );

        sched::remove_thread(lock.borrow_mut(), current);
        current.st.replace(&mut *lock, ThreadSt::Waiting);
        current.wait_result.replace(&mut *lock, Ok(()));
        current.blocked_on.replace(&mut *lock, None);

        // Completes once the expiry callback re-readied the caller.
        sched::unlock_and_reschedule(lock);

        let mut lock = klock::lock_cpu::<Traits>()?;
        cancel_if_armed(lock.borrow_mut(), &timer);
        current.wait_result.get(&*lock)
    }
}
