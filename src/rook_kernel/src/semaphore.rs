//! Counting semaphores.
use core::fmt;

use crate::{
    error::{BadContextError, WaitError},
    hook,
    hook::{api_assert, internal_assert},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    readyqueue::Queue as _,
    sched, timeout,
    thread::{ThreadCb, ThreadSt},
    utils::Init,
    KernelCfg, KernelTraits, SemCount, System, Ticks,
};

pub(crate) const SEMAPHORE_SIGNATURE: usize = 0x5253_454d;

/// The back-tag a blocked thread carries, naming the waiter queue that owns
/// its linkage. Semaphore storage is caller-owned `'static`, so the tag is
/// an ordinary reference.
pub(crate) type SemaphoreRef<Traits> = &'static SemaphoreCb<Traits>;

/// *Semaphore control block* - the state data of a counting semaphore.
///
/// The storage is caller-owned and must outlive the semaphore.
pub struct SemaphoreCb<Traits: KernelCfg> {
    /// The signed count. Invariant: a negative count's magnitude equals the
    /// number of waiters; a positive count implies no waiters.
    pub(crate) count: CpuLockCell<Traits, SemCount>,

    /// Waiting threads, ordered the same way as the ready queue: by
    /// priority, FIFO among equals.
    pub(crate) waiters: Traits::ThreadQueue,

    pub(crate) signature: CpuLockCell<Traits, usize>,
}

impl<Traits: KernelCfg> SemaphoreCb<Traits> {
    /// A control block ready to be passed to
    /// [`sem_init`](crate::System::sem_init).
    pub const fn new() -> Self {
        <Self as Init>::INIT
    }
}

impl<Traits: KernelCfg> Init for SemaphoreCb<Traits> {
    const INIT: Self = Self {
        count: Init::INIT,
        waiters: Init::INIT,
        signature: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("count", &self.count)
            .field("waiters", &self.waiters)
            .finish_non_exhaustive()
    }
}

/// Reposition a waiting thread in its waiter queue under a new priority.
/// Threads waiting on no queue (timer sleeps) just take the new priority.
pub(crate) fn reorder_waiter<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    priority: crate::Priority,
) {
    match thread.blocked_on.get(&*lock) {
        Some(sem) => {
            // Remove under the old priority, reinsert under the new one.
            sem.waiters.remove(lock.borrow_mut(), thread);
            thread.prio.replace(&mut *lock, priority);
            thread.base_prio.replace(&mut *lock, priority);
            sem.waiters.insert(lock.borrow_mut(), thread);
        }
        None => {
            thread.prio.replace(&mut *lock, priority);
            thread.base_prio.replace(&mut *lock, priority);
        }
    }
}

/// The timeout callback of [`System::sem_wait_timeout`]. Runs in interrupt
/// context with the CPU lock inactive; `param` is the waiting thread.
fn abort_wait<Traits: KernelTraits>(param: usize) {
    // Safety: converting back the pointer `sem_wait_inner` armed us with;
    // the thread control block is `'static`
    let thread = unsafe { &*(param as *const ThreadCb<Traits>) };

    let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
        return;
    };

    if thread.st.get(&*lock) != ThreadSt::Waiting {
        // Already signaled between expiry and this callback.
        return;
    }
    let Some(sem) = thread.blocked_on.get(&*lock) else {
        return;
    };

    // Undo the wait: the count regains the slot the aborted decrement took.
    sem.waiters.remove(lock.borrow_mut(), thread);
    let count = sem.count.get(&*lock);
    sem.count.replace(&mut *lock, count + 1);

    thread.blocked_on.replace(&mut *lock, None);
    thread.wait_result.replace(&mut *lock, Err(WaitError::Timeout));
    thread.st.replace(&mut *lock, ThreadSt::Ready);
    sched::insert_thread(lock.borrow_mut(), thread);
}

fn wait_inner<Traits: KernelTraits>(
    sem: &'static SemaphoreCb<Traits>,
    timeout_ticks: Option<Ticks>,
) -> Result<(), WaitError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    api_assert!(
        Traits,
        sem.signature.get(&*lock) == SEMAPHORE_SIGNATURE,
        "semaphore is not initialized",
    );
    api_assert!(
        Traits,
        sched::state_of(lock.borrow_mut()).is_empty(),
        "sem_wait may only block from an unlocked thread context",
    );

    let count = sem.count.get(&*lock) - 1;
    sem.count.replace(&mut *lock, count);

    if count >= 0 {
        return Ok(());
    }

    let Some(current) = Traits::state().sched.current.get(&*lock) else {
        hook::assert_failed::<Traits>(
            module_path!(),
            file!(),
            line!(),
            "current.is_some()",
            "sem_wait requires a running thread",
        )
    };

    // Block the caller: leave the ready queue, join the waiter queue.
    sched::remove_thread(lock.borrow_mut(), current);
    current.st.replace(&mut *lock, ThreadSt::Waiting);
    current.wait_result.replace(&mut *lock, Ok(()));
    current.blocked_on.replace(&mut *lock, Some(sem));
    sem.waiters.insert(lock.borrow_mut(), current);

    match timeout_ticks {
        None => {
            // This statement completes once a wake-upper re-readied the
            // caller and the scheduler returned the processor to it.
            sched::unlock_and_reschedule(lock);

            let lock = klock::lock_cpu::<Traits>()?;
            current.wait_result.get(&*lock)
        }
        Some(ticks) => {
            // The timeout object lives on the blocked caller's stack; it is
            // unlinked by expiry or by the cancellation below, both before
            // this frame is left.
            let timer: timeout::TimerCb<Traits> = Init::INIT;
            timeout::arm_at(
                lock.borrow_mut(),
                &timer,
                ticks,
                abort_wait::<Traits>,
                current as *const _ as usize,
            );

            sched::unlock_and_reschedule(lock);

            let mut lock = klock::lock_cpu::<Traits>()?;
            timeout::cancel_if_armed(lock.borrow_mut(), &timer);
            current.wait_result.get(&*lock)
        }
    }
}

/// These associated functions implement the semaphore API.
impl<Traits: KernelTraits> System<Traits> {
    /// Initialize a semaphore with the given count. A zero count makes it a
    /// pure synchronization gate.
    pub fn sem_init(
        sem: &'static SemaphoreCb<Traits>,
        count: SemCount,
    ) -> Result<(), BadContextError> {
        api_assert!(Traits, count >= 0, "initial count must be non-negative");

        let mut lock = klock::lock_cpu::<Traits>()?;
        api_assert!(
            Traits,
            sem.signature.get(&*lock) != SEMAPHORE_SIGNATURE,
            "semaphore is already initialized",
        );
        internal_assert!(
            Traits,
            sem.waiters.is_empty(lock.borrow_mut()),
            "fresh semaphore has waiters",
        );

        sem.count.replace(&mut *lock, count);
        sem.signature.replace(&mut *lock, SEMAPHORE_SIGNATURE);
        Ok(())
    }

    /// Decrement the count, blocking while the result would be negative.
    ///
    /// Returns `Ok` on a normal signal and `ObjectRemoved` if the semaphore
    /// was terminated while the caller was blocked.
    pub fn sem_wait(sem: &'static SemaphoreCb<Traits>) -> Result<(), WaitError> {
        wait_inner(sem, None)
    }

    /// Like [`sem_wait`](Self::sem_wait), but give up with
    /// [`WaitError::Timeout`] after `ticks` system ticks.
    pub fn sem_wait_timeout(
        sem: &'static SemaphoreCb<Traits>,
        ticks: Ticks,
    ) -> Result<(), WaitError> {
        api_assert!(Traits, ticks > 0, "timeout must be at least one tick");
        wait_inner(sem, Some(ticks))
    }

    /// Signal the semaphore, waking the highest-priority waiter (FIFO among
    /// equals) if one exists.
    ///
    /// Safe to call from interrupt handlers; a switch to a woken
    /// higher-priority thread then happens on ISR exit.
    pub fn sem_signal(sem: &'static SemaphoreCb<Traits>) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        api_assert!(
            Traits,
            sem.signature.get(&*lock) == SEMAPHORE_SIGNATURE,
            "semaphore is not initialized",
        );

        if let Some(waiter) = sem.waiters.front(lock.borrow_mut()) {
            sem.waiters.remove(lock.borrow_mut(), waiter);
            waiter.wait_result.replace(&mut *lock, Ok(()));
            waiter.blocked_on.replace(&mut *lock, None);
            waiter.st.replace(&mut *lock, ThreadSt::Ready);
            sched::insert_thread(lock.borrow_mut(), waiter);
        }

        // Wake first, then increment: a non-negative count must never
        // coexist with waiters.
        let count = sem.count.get(&*lock);
        api_assert!(Traits, count < SemCount::MAX, "semaphore count overflow");
        sem.count.replace(&mut *lock, count.wrapping_add(1));

        internal_assert!(
            Traits,
            sem.count.get(&*lock) <= 0 || sem.waiters.is_empty(lock.borrow_mut()),
            "positive count coexists with waiters",
        );

        sched::unlock_and_reschedule(lock);
        Ok(())
    }

    /// Terminate the semaphore. Every waiter is re-readied with
    /// [`WaitError::ObjectRemoved`]; the scheduler is evaluated once.
    pub fn sem_term(sem: &'static SemaphoreCb<Traits>) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        api_assert!(
            Traits,
            sem.signature.get(&*lock) == SEMAPHORE_SIGNATURE,
            "semaphore is not initialized",
        );

        while let Some(waiter) = sem.waiters.front(lock.borrow_mut()) {
            sem.waiters.remove(lock.borrow_mut(), waiter);
            waiter.wait_result
                .replace(&mut *lock, Err(WaitError::ObjectRemoved));
            waiter.blocked_on.replace(&mut *lock, None);
            waiter.st.replace(&mut *lock, ThreadSt::Ready);
            sched::insert_thread(lock.borrow_mut(), waiter);
        }

        sem.count.replace(&mut *lock, 0);
        sem.signature.replace(&mut *lock, !SEMAPHORE_SIGNATURE);

        sched::unlock_and_reschedule(lock);
        Ok(())
    }

    /// Get the semaphore's current count. Negative magnitude is the number
    /// of blocked waiters.
    pub fn sem_count(sem: &'static SemaphoreCb<Traits>) -> Result<SemCount, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        api_assert!(
            Traits,
            sem.signature.get(&*lock) == SEMAPHORE_SIGNATURE,
            "semaphore is not initialized",
        );
        Ok(sem.count.get(&*lock))
    }
}
