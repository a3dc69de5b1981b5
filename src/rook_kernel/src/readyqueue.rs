//! Ready queue implementation.
//!
//! The same structure backs the scheduler's run queue and every semaphore's
//! waiter queue: a priority bitmap plus one FIFO per bucket, where a bucket
//! covers one priority level (the common configuration) or a power-of-two
//! group of adjacent levels when `PRIORITY_BUCKETS` is configured coarser
//! than `PRIORITY_LEVELS`. Within a bucket, threads are kept in descending
//! priority order, FIFO among equals, so the bucket head is always the next
//! thread to pick.
use core::fmt;

use crate::{
    hook::internal_assert,
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    thread::ThreadCb,
    utils::{ceil_log2, div_ceil, Ident, Init, Link, ListHead, PrioBitmap},
    KernelCfg, KernelTraits, Priority,
};

/// Identity-compared reference to a queued thread.
pub(crate) type ThreadRef<Traits> = Ident<&'static ThreadCb<Traits>>;

/// A priority-indexed thread queue.
///
/// This trait is not intended to be implemented on custom types.
pub trait Queue<Traits>: Send + Sync + Init + fmt::Debug + 'static + private::Sealed {
    /// The number of priority levels the queue was instantiated for.
    const LEVELS: usize;

    /// The number of bitmap buckets the queue was instantiated for.
    const BUCKETS: usize;

    /// Insert `thread` at its current priority, behind any thread of equal
    /// priority already in the queue.
    ///
    /// Precondition: `thread` is in no queue.
    fn insert(&self, lock: CpuLockTokenRefMut<'_, Traits>, thread: &'static ThreadCb<Traits>)
    where
        Traits: KernelTraits;

    /// Unlink `thread`.
    ///
    /// Precondition: `thread` was inserted into this queue.
    fn remove(&self, lock: CpuLockTokenRefMut<'_, Traits>, thread: &'static ThreadCb<Traits>)
    where
        Traits: KernelTraits;

    /// Get the highest-priority thread, FIFO among equals.
    fn front(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Option<&'static ThreadCb<Traits>>
    where
        Traits: KernelTraits;

    /// Move the first thread of the priority class `priority` behind its
    /// equal-priority peers and return the class's new first thread.
    ///
    /// Precondition: the class is non-empty.
    fn rotate(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        priority: Priority,
    ) -> Option<&'static ThreadCb<Traits>>
    where
        Traits: KernelTraits;

    /// Check if no thread is queued.
    fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool
    where
        Traits: KernelTraits;
}

/// Implements [the sealed trait pattern], which protects [`Queue`] against
/// downstream implementations.
///
/// [the sealed trait pattern]: https://rust-lang.github.io/api-guidelines/future-proofing.html
mod private {
    pub trait Sealed {}
}

/// The [`Queue`] implementation: a two-level priority bitmap plus one
/// circular doubly-linked list per bucket, linked through
/// [`ThreadCb::link`].
///
/// [`ThreadCb::link`]: crate::thread::ThreadCb
pub struct BitmapQueue<Traits: KernelCfg, const LEVELS: usize, const BUCKETS: usize> {
    /// Invariant: bit `b` is set iff `buckets[b]` is non-empty.
    bitmap: CpuLockCell<Traits, PrioBitmap>,
    buckets: [CpuLockCell<Traits, ListHead<ThreadRef<Traits>>>; BUCKETS],
}

impl<Traits: KernelCfg, const LEVELS: usize, const BUCKETS: usize> Init
    for BitmapQueue<Traits, LEVELS, BUCKETS>
{
    const INIT: Self = Self {
        bitmap: Init::INIT,
        buckets: Init::INIT,
    };
}

impl<Traits: KernelCfg, const LEVELS: usize, const BUCKETS: usize> private::Sealed
    for BitmapQueue<Traits, LEVELS, BUCKETS>
{
}

impl<Traits: KernelTraits, const LEVELS: usize, const BUCKETS: usize>
    BitmapQueue<Traits, LEVELS, BUCKETS>
{
    /// How far a priority is shifted down to obtain its bucket index. Zero
    /// when every level has a bucket of its own.
    const BUCKET_SHIFT: u32 = ceil_log2(div_ceil(LEVELS, BUCKETS));

    #[inline]
    fn bucket_of(priority: Priority) -> usize {
        (priority as usize) >> Self::BUCKET_SHIFT
    }

    /// Append `thread` to the back of bucket `b`, ignoring priority order.
    fn push_back(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        b: usize,
        thread: &'static ThreadCb<Traits>,
    ) {
        let head = self.buckets[b].get(&**lock);
        match head.first {
            None => {
                thread.link.replace(
                    &mut **lock,
                    Some(Link {
                        prev: Ident(thread),
                        next: Ident(thread),
                    }),
                );
                self.buckets[b].replace(
                    &mut **lock,
                    ListHead {
                        first: Some(Ident(thread)),
                    },
                );
            }
            Some(first) => {
                let tail = link_of(lock, first.0).prev;
                thread
                    .link
                    .replace(&mut **lock, Some(Link { prev: tail, next: first }));
                set_next(lock, tail.0, Ident(thread));
                set_prev(lock, first.0, Ident(thread));
            }
        }
    }

    /// Insert `thread` into bucket `b` keeping the bucket sorted by
    /// descending priority, behind existing equal-priority threads.
    ///
    /// The scan starts at the back: the new thread goes after the first
    /// thread (from the back) whose priority is not lower.
    fn insert_sorted(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        b: usize,
        thread: &'static ThreadCb<Traits>,
    ) {
        let priority = thread.prio.get(&**lock);
        let head = self.buckets[b].get(&**lock);
        let Some(first) = head.first else {
            self.push_back(lock, b, thread);
            return;
        };

        let mut cursor = link_of(lock, first.0).prev;
        loop {
            if cursor.0.prio.get(&**lock) >= priority {
                let next = link_of(lock, cursor.0).next;
                thread.link.replace(
                    &mut **lock,
                    Some(Link {
                        prev: cursor,
                        next,
                    }),
                );
                set_next(lock, cursor.0, Ident(thread));
                set_prev(lock, next.0, Ident(thread));
                return;
            }
            if cursor == first {
                break;
            }
            cursor = link_of(lock, cursor.0).prev;
        }

        // Nothing in the bucket outranks `thread`; it becomes the new front.
        let tail = link_of(lock, first.0).prev;
        thread
            .link
            .replace(&mut **lock, Some(Link { prev: tail, next: first }));
        set_next(lock, tail.0, Ident(thread));
        set_prev(lock, first.0, Ident(thread));
        self.buckets[b].replace(
            &mut **lock,
            ListHead {
                first: Some(Ident(thread)),
            },
        );
    }

    fn unlink(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        b: usize,
        thread: &'static ThreadCb<Traits>,
    ) {
        let l = link_of(lock, thread);
        if l.next == Ident(thread) {
            self.buckets[b].replace(&mut **lock, ListHead { first: None });
        } else {
            set_next(lock, l.prev.0, l.next);
            set_prev(lock, l.next.0, l.prev);
            let head = self.buckets[b].get(&**lock);
            if head.first == Some(Ident(thread)) {
                self.buckets[b].replace(&mut **lock, ListHead { first: Some(l.next) });
            }
        }
        thread.link.replace(&mut **lock, None);
    }

    /// Find the first thread of the priority class `priority` in bucket `b`.
    fn class_front(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        b: usize,
        priority: Priority,
    ) -> Option<ThreadRef<Traits>> {
        let first = self.buckets[b].get(&**lock).first?;
        let mut cursor = first;
        loop {
            let p = cursor.0.prio.get(&**lock);
            if p == priority {
                return Some(cursor);
            }
            if p < priority {
                // The bucket is sorted; the class is absent.
                return None;
            }
            cursor = link_of(lock, cursor.0).next;
            if cursor == first {
                return None;
            }
        }
    }
}

#[inline]
fn link_of<Traits: KernelTraits>(
    lock: &CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) -> Link<ThreadRef<Traits>> {
    match thread.link.get(&**lock) {
        Some(link) => link,
        // A thread reachable from a queue is always linked.
        None => unreachable!(),
    }
}

#[inline]
fn set_next<Traits: KernelTraits>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    value: ThreadRef<Traits>,
) {
    let mut l = link_of(lock, thread);
    l.next = value;
    thread.link.replace(&mut **lock, Some(l));
}

#[inline]
fn set_prev<Traits: KernelTraits>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    value: ThreadRef<Traits>,
) {
    let mut l = link_of(lock, thread);
    l.prev = value;
    thread.link.replace(&mut **lock, Some(l));
}

impl<Traits: KernelTraits, const LEVELS: usize, const BUCKETS: usize> Queue<Traits>
    for BitmapQueue<Traits, LEVELS, BUCKETS>
{
    const LEVELS: usize = LEVELS;
    const BUCKETS: usize = BUCKETS;

    fn insert(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, thread: &'static ThreadCb<Traits>)
    where
        Traits: KernelTraits,
    {
        let priority = thread.prio.get(&*lock);
        internal_assert!(
            Traits,
            thread.link.get(&*lock).is_none(),
            "thread is already in a queue",
        );
        internal_assert!(
            Traits,
            (priority as usize) < LEVELS,
            "priority out of range",
        );

        let b = Self::bucket_of(priority);
        if Self::BUCKET_SHIFT == 0 {
            self.push_back(&mut lock, b, thread);
        } else {
            self.insert_sorted(&mut lock, b, thread);
        }
        self.bitmap.write(&mut *lock).set(b);
    }

    fn remove(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, thread: &'static ThreadCb<Traits>)
    where
        Traits: KernelTraits,
    {
        internal_assert!(
            Traits,
            thread.link.get(&*lock).is_some(),
            "thread is not queued",
        );

        let b = Self::bucket_of(thread.prio.get(&*lock));
        self.unlink(&mut lock, b, thread);
        if self.buckets[b].get(&*lock).first.is_none() {
            self.bitmap.write(&mut *lock).clear(b);
        }
    }

    fn front(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Option<&'static ThreadCb<Traits>>
    where
        Traits: KernelTraits,
    {
        let b = self.bitmap.read(&*lock).find_last_set()?;
        match self.buckets[b].get(&*lock).first {
            Some(first) => Some(first.0),
            // The bitmap invariant guarantees a non-empty bucket.
            None => unreachable!(),
        }
    }

    fn rotate(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        priority: Priority,
    ) -> Option<&'static ThreadCb<Traits>>
    where
        Traits: KernelTraits,
    {
        let b = Self::bucket_of(priority);
        let front = self.class_front(&mut lock, b, priority)?;

        // Unlinking and re-inserting lands the thread behind its
        // equal-priority peers. The bitmap bit stays set throughout.
        self.unlink(&mut lock, b, front.0);
        if Self::BUCKET_SHIFT == 0 {
            self.push_back(&mut lock, b, front.0);
        } else {
            self.insert_sorted(&mut lock, b, front.0);
        }

        self.class_front(&mut lock, b, priority).map(|t| t.0)
    }

    fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool
    where
        Traits: KernelTraits,
    {
        self.bitmap.read(&*lock).is_empty()
    }
}

impl<Traits: KernelTraits, const LEVELS: usize, const BUCKETS: usize> fmt::Debug
    for BitmapQueue<Traits, LEVELS, BUCKETS>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(lock) = lock_cpu::<Traits>() {
            f.debug_struct("BitmapQueue")
                .field("bitmap", self.bitmap.read(&*lock))
                .finish_non_exhaustive()
        } else {
            f.write_str("BitmapQueue { < locked > }")
        }
    }
}
