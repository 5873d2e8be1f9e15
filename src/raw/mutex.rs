use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

#[cfg(not(all(loom, test)))]
use core::ops::{Deref, DerefMut};

#[cfg(all(loom, test))]
use loom::cell::{ConstPtr, MutPtr};

#[cfg(all(loom, test))]
use crate::loom::{Guard, GuardDeref, GuardDerefMut};

use crate::cfg::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicUsize};
use crate::cfg::cell::{UnsafeCell, WithUnchecked};
use crate::relax::Relax;
use crate::topology::{DomainId, Topology};

/// The lowest valid slot handle.
///
/// Handles are slot indices offset by this base, so that no handle can ever
/// collide with the grant sentinels `0` (pending) and `1` (granted).
const BASE: usize = 2;

/// Decoded state of a slot's grant word.
///
/// The word is the hand-off channel written by the predecessor: while zero
/// the waiter is still queued; once non-zero the waiter holds the lock, and
/// any value above [`Granted`] doubles as the handle of the tail of the
/// secondary queue the new holder inherits.
///
/// [`Granted`]: Grant::Granted
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Grant {
    /// Still queued, the lock has not been handed off to this slot.
    Pending,
    /// Lock granted, no secondary queue attached.
    Granted,
    /// Lock granted, along with the handle of the secondary queue's tail.
    Queue(usize),
}

impl Grant {
    /// Decodes a grant word.
    const fn decode(word: usize) -> Self {
        match word {
            0 => Self::Pending,
            1 => Self::Granted,
            tail => Self::Queue(tail),
        }
    }

    /// Encodes this grant state back into its word representation.
    const fn encode(self) -> usize {
        match self {
            Self::Pending => 0,
            Self::Granted => 1,
            Self::Queue(tail) => tail,
        }
    }
}

/// One pre-allocated slot of a lock's waiter arena.
///
/// A slot is owned by at most one waiter at a time (see `claimed`). While
/// queued, each of its fields has a single writer: the owner initializes all
/// fields before publishing the slot, the successor writes `next` exactly
/// once while linking, and the predecessor writes `grant` (and `queued_at`)
/// exactly once during hand-off. Holders additionally reuse the `next`
/// fields of the slots they detached to thread the circular secondary queue.
#[repr(align(128))]
struct Slot {
    /// Successor handle in the primary queue, or the circular link while
    /// this slot sits on a secondary queue. Zero means none.
    next: AtomicUsize,
    /// The hand-off word, see [`Grant`] for the encoding.
    grant: AtomicUsize,
    /// Locality domain advertised by the owner for this acquisition.
    domain: AtomicU32,
    /// Monotonic timestamp taken when the owner's secondary queue was
    /// created; carried along when the queue is inherited by a successor.
    queued_at: AtomicU64,
    /// Arena occupancy flag, held while some [`Waiter`] owns this slot.
    claimed: AtomicBool,
}

impl Slot {
    /// An unclaimed, quiescent slot (const).
    #[cfg(not(all(loom, test)))]
    #[allow(clippy::declare_interior_mutable_const)]
    const UNCLAIMED: Self = Self {
        next: AtomicUsize::new(0),
        grant: AtomicUsize::new(0),
        domain: AtomicU32::new(0),
        queued_at: AtomicU64::new(0),
        claimed: AtomicBool::new(false),
    };

    /// Creates an unclaimed Loom based slot (non-const).
    #[cfg(all(loom, test))]
    fn unclaimed() -> Self {
        Self {
            next: AtomicUsize::new(0),
            grant: AtomicUsize::new(0),
            domain: AtomicU32::new(0),
            queued_at: AtomicU64::new(0),
            claimed: AtomicBool::new(false),
        }
    }

    /// Resets this slot for a fresh acquisition.
    ///
    /// Must run before the slot is published to the queue; afterwards the
    /// owner may no longer write these fields until granted.
    fn prepare<P: Topology>(&self) {
        self.next.store(0, Relaxed);
        self.grant.store(Grant::Pending.encode(), Relaxed);
        self.domain.store(P::domain().into_raw(), Relaxed);
        self.queued_at.store(0, Relaxed);
    }

    /// Returns `true` once the secondary queue rooted at this slot is old
    /// enough that the next release must flush it.
    fn expired<P: Topology>(&self, flush_after: u64) -> bool {
        P::timestamp().saturating_sub(self.queued_at.load(Relaxed)) >= flush_after
    }
}

/// Tunables bounding how long the lock may keep favoring one domain.
///
/// Both parameters trade fairness latency for throughput and never affect
/// correctness: waiters parked on a secondary queue are reconsidered at
/// most one `flush_after` window after the queue was created, and filtering
/// itself is only an optimization opportunity.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Fairness {
    /// How long a secondary queue may exist before the releasing holder
    /// must splice it back onto the primary queue, in nanoseconds of the
    /// topology's clock. Zero flushes on every release.
    pub flush_after: u64,
    /// A holder without a secondary queue starts filtering with probability
    /// `2^-filter_shift` per acquisition; larger values make filtering
    /// rarer under light contention. Capped at 31.
    pub filter_shift: u32,
}

impl Fairness {
    /// A flush window of ~1ms and roughly one filtering pass per 128
    /// uncommitted acquisitions.
    pub const DEFAULT: Self = Self { flush_after: 1_000_000, filter_shift: 7 };
}

impl Default for Fairness {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Outcome of one filtering attempt against the immediate successor.
enum Filter {
    /// Successor shares the holder's domain or is a priority waiter,
    /// nothing to reorder.
    Matched,
    /// Successor mismatches but is the queue's tail; detaching it would
    /// race the append path, so it stays put until a later pass.
    Deferred,
    /// Successor was detached and filed on the secondary queue.
    Spliced,
}

/// A mutual exclusion primitive implementing the compact NUMA-aware lock
/// protocol, useful for protecting shared data.
///
/// This lock is an MCS-style queue lock: contending waiters form a queue and
/// each spins on its own arena slot, so the only globally contended cell is
/// the tail word. On top of that, a holder opportunistically reorders the
/// queue so that waiters from its own locality domain are served first,
/// parking mismatched waiters on a secondary queue that is spliced back
/// within a bounded time window (see [`Fairness`]).
///
/// The mutex is generic over the relax policy `R` (see [`relax`]), the
/// locality classification `P` (see [`topology`]) and the waiter arena
/// capacity `N`, which bounds the number of concurrently queued waiters.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use cnalock::raw::Mutex;
/// use cnalock::relax::Spin;
/// use cnalock::topology::Flat;
///
/// type SpinMutex<T> = Mutex<T, Spin, Flat>;
///
/// let mutex = Arc::new(SpinMutex::new(0));
/// let c_mutex = Arc::clone(&mutex);
///
/// thread::spawn(move || {
///     let mut waiter = c_mutex.waiter();
///     *waiter.lock() = 10;
/// })
/// .join().expect("thread::spawn failed");
///
/// let mut waiter = mutex.waiter();
/// assert_eq!(*waiter.lock(), 10);
/// ```
/// [`relax`]: crate::relax
/// [`topology`]: crate::topology
pub struct Mutex<T: ?Sized, R, P, const N: usize = 32> {
    tail: AtomicUsize,
    fairness: Fairness,
    slots: [Slot; N],
    marker: PhantomData<(R, P)>,
    data: UnsafeCell<T>,
}

// Same unsafe impls as `std::sync::Mutex`.
unsafe impl<T: ?Sized + Send, R, P, const N: usize> Send for Mutex<T, R, P, N> {}
unsafe impl<T: ?Sized + Send, R, P, const N: usize> Sync for Mutex<T, R, P, N> {}

impl<T, R, P, const N: usize> Mutex<T, R, P, N> {
    /// Creates a new mutex in an unlocked state ready for use, with the
    /// default [`Fairness`] tunables.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnalock::raw::spins::Mutex;
    ///
    /// const MUTEX: Mutex<i32> = Mutex::new(0);
    /// let mutex = Mutex::new(0);
    /// ```
    #[cfg(not(all(loom, test)))]
    #[inline]
    pub const fn new(value: T) -> Self {
        Self::with_fairness(value, Fairness::DEFAULT)
    }

    /// Creates a new, unlocked mutex with caller-chosen [`Fairness`]
    /// tunables.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnalock::raw::{spins::Mutex, Fairness};
    ///
    /// let fairness = Fairness { flush_after: 500_000, filter_shift: 5 };
    /// let mutex = Mutex::with_fairness(0, fairness);
    /// ```
    #[cfg(not(all(loom, test)))]
    pub const fn with_fairness(value: T, fairness: Fairness) -> Self {
        let tail = AtomicUsize::new(0);
        let data = UnsafeCell::new(value);
        Self { tail, fairness, slots: [Slot::UNCLAIMED; N], marker: PhantomData, data }
    }

    /// Creates a new unlocked mutex with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    pub(crate) fn new(value: T) -> Self {
        Self::with_fairness(value, Fairness::DEFAULT)
    }

    /// Creates a new unlocked, Loom based mutex with caller-chosen
    /// [`Fairness`] tunables (non-const).
    #[cfg(all(loom, test))]
    pub(crate) fn with_fairness(value: T, fairness: Fairness) -> Self {
        let tail = AtomicUsize::new(0);
        let data = UnsafeCell::new(value);
        let slots = core::array::from_fn(|_| Slot::unclaimed());
        Self { tail, fairness, slots, marker: PhantomData, data }
    }

    /// Consumes this mutex, returning the underlying data.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnalock::raw::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// assert_eq!(mutex.into_inner(), 0);
    /// ```
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized, R: Relax, P: Topology, const N: usize> Mutex<T, R, P, N> {
    /// Claims a slot of the waiter arena, blocking until one is available.
    ///
    /// A [`Waiter`] backs any number of sequential acquisitions, so callers
    /// typically claim one per thread and keep it for as long as the thread
    /// contends on this lock. If all `N` slots are claimed, this spins with
    /// the lock's relax policy until some other waiter is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnalock::raw::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// let mut waiter = mutex.waiter();
    /// *waiter.lock() += 1;
    /// assert_eq!(*waiter.lock(), 1);
    /// ```
    pub fn waiter(&self) -> Waiter<'_, T, R, P, N> {
        let mut relax = R::new();
        loop {
            match self.try_waiter() {
                Some(waiter) => return waiter,
                None => relax.relax(),
            }
        }
    }

    /// Claims a slot of the waiter arena, without blocking.
    ///
    /// Returns [`None`] if all `N` slots are currently claimed.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnalock::raw::Mutex;
    /// use cnalock::relax::Spin;
    /// use cnalock::topology::Flat;
    ///
    /// let mutex: Mutex<i32, Spin, Flat, 1> = Mutex::new(0);
    ///
    /// let first = mutex.try_waiter();
    /// assert!(first.is_some());
    /// assert!(mutex.try_waiter().is_none());
    ///
    /// drop(first);
    /// assert!(mutex.try_waiter().is_some());
    /// ```
    pub fn try_waiter(&self) -> Option<Waiter<'_, T, R, P, N>> {
        for (index, slot) in self.slots.iter().enumerate() {
            let claim = slot.claimed.compare_exchange(false, true, Acquire, Relaxed);
            if claim.is_ok() {
                return Some(Waiter::new(self, index));
            }
        }
        None
    }

    /// Acquires this mutex and then runs the closure against its guard.
    ///
    /// A waiter arena slot is transparently claimed for the closure scope.
    /// This function will block if the lock is unavailable.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// use cnalock::raw::spins::Mutex;
    ///
    /// let mutex = Arc::new(Mutex::new(0));
    /// let c_mutex = Arc::clone(&mutex);
    ///
    /// thread::spawn(move || {
    ///     c_mutex.lock_with(|mut guard| *guard = 10);
    /// })
    /// .join().expect("thread::spawn failed");
    ///
    /// assert_eq!(mutex.lock_with(|guard| *guard), 10);
    /// ```
    ///
    /// Borrows of the guard or its data cannot escape the given closure.
    ///
    /// ```compile_fail,E0515
    /// use cnalock::raw::spins::Mutex;
    ///
    /// let mutex = Mutex::new(1);
    /// let data = mutex.lock_with(|guard| &*guard);
    /// ```
    pub fn lock_with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(MutexGuard<'_, T, R, P, N>) -> Ret,
    {
        let mut waiter = self.waiter();
        f(waiter.lock())
    }

    /// Attempts to acquire this mutex and then runs the closure against its
    /// guard.
    ///
    /// The closure is given [`None`] when the lock is already held or when
    /// no arena slot could be claimed without blocking.
    ///
    /// This function does not block.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// use cnalock::raw::spins::Mutex;
    ///
    /// let mutex = Arc::new(Mutex::new(0));
    /// let c_mutex = Arc::clone(&mutex);
    ///
    /// thread::spawn(move || {
    ///     c_mutex.try_lock_with(|guard| {
    ///         if let Some(mut guard) = guard {
    ///             *guard = 10;
    ///         }
    ///     });
    /// })
    /// .join().expect("thread::spawn failed");
    ///
    /// assert_eq!(mutex.lock_with(|guard| *guard), 10);
    /// ```
    pub fn try_lock_with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(Option<MutexGuard<'_, T, R, P, N>>) -> Ret,
    {
        match self.try_waiter() {
            Some(mut waiter) => f(waiter.try_lock()),
            None => f(None),
        }
    }

    /// Releases the lock held through `index`, handing it off to a
    /// successor if there is one.
    ///
    /// Flushes the secondary queue back onto the primary queue when its
    /// fairness window has expired or when the primary queue ran out;
    /// otherwise the successor inherits the still-unflushed secondary
    /// queue together with its creation timestamp.
    fn unlock(&self, index: usize) {
        let slot = &self.slots[index];
        let handle = index + BASE;
        let grant = Grant::decode(slot.grant.load(Relaxed));
        let mut next = slot.next.load(Relaxed);

        let Grant::Queue(sec_tail) = grant else {
            // No secondary queue: plain MCS hand-off.
            if next == 0 {
                // If we are the tail, dequeue and free the lock.
                let false = self.try_unlock(handle) else { return };
                // But if we are not the tail, then we have a pending
                // successor. We must wait for them to finish linking with us.
                next = self.wait_next(slot);
            }
            fence(Acquire);
            self.slot(next).grant.store(Grant::Granted.encode(), Release);
            return;
        };

        if next != 0 && !slot.expired::<P>(self.fairness.flush_after) {
            // The secondary queue is not due yet: the successor inherits
            // it, along with the timestamp of its creation so that the
            // flush deadline stays tied to the queue, not to the holder.
            fence(Acquire);
            let successor = self.slot(next);
            successor.queued_at.store(slot.queued_at.load(Relaxed), Relaxed);
            successor.grant.store(Grant::Queue(sec_tail).encode(), Release);
            return;
        }

        // Flush: splice the whole secondary queue to the front of the
        // primary queue and hand the lock to its head.
        let tail_slot = self.slot(sec_tail);
        let head = tail_slot.next.load(Relaxed);
        if next == 0 {
            // The circle must be broken before the tail handle is
            // published: from then on the first appender owns that `next`.
            tail_slot.next.store(0, Relaxed);
            let exchange = self.tail.compare_exchange(handle, sec_tail, Release, Relaxed);
            if exchange.is_err() {
                // An appender beat the exchange; it is linking with us, and
                // the spliced chain goes in front of it.
                next = self.wait_next(slot);
                fence(Acquire);
                tail_slot.next.store(next, Relaxed);
            }
        } else {
            fence(Acquire);
            tail_slot.next.store(next, Relaxed);
        }
        self.slot(head).grant.store(Grant::Granted.encode(), Release);
    }

    /// Spins until a linking successor publishes itself on `slot.next`,
    /// returning its handle.
    fn wait_next(&self, slot: &Slot) -> usize {
        let mut relax = R::new();
        loop {
            let next = slot.next.load(Relaxed);
            let true = next == 0 else { return next };
            relax.relax();
        }
    }

    /// Attempts to detach the immediate successor of `slot` into the
    /// holder's secondary queue if their locality domains mismatch.
    ///
    /// The secondary queue is a circular list threaded through the `next`
    /// fields of the detached slots; the handle of its tail lives in the
    /// holder's own grant word, and `tail.next` recovers its head.
    fn filter(&self, slot: &Slot, domain: DomainId) -> Filter {
        let next_handle = slot.next.load(Acquire);
        if next_handle == 0 {
            return Filter::Matched;
        }
        let next = self.slot(next_handle);
        let next_domain = DomainId::from_raw(next.domain.load(Relaxed));
        if next_domain.is_priority() || next_domain == domain {
            return Filter::Matched;
        }
        // The successor mismatches, but without a known successor of its
        // own it is the queue's tail, and detaching the tail would race
        // the append path. Leave it for a later pass.
        let nnext = next.next.load(Acquire);
        if nnext == 0 {
            return Filter::Deferred;
        }
        slot.next.store(nnext, Relaxed);
        match Grant::decode(slot.grant.load(Relaxed)) {
            Grant::Queue(tail) => {
                // Splice behind the existing tail, keeping the circle.
                let head = self.slot(tail).next.load(Relaxed);
                self.slot(tail).next.store(next_handle, Relaxed);
                next.next.store(head, Relaxed);
            }
            _ => {
                // First filtered waiter: a one-element circular list, with
                // the creation time starting the fairness window.
                next.next.store(next_handle, Relaxed);
                slot.queued_at.store(P::timestamp(), Relaxed);
            }
        }
        slot.grant.store(Grant::Queue(next_handle).encode(), Relaxed);
        Filter::Spliced
    }
}

impl<T: ?Sized, R, P, const N: usize> Mutex<T, R, P, N> {
    /// Returns `true` if the lock is currently held.
    ///
    /// This method does not provide any synchronization guarantees, so its
    /// only useful as a heuristic, and so must be considered not up to date.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnalock::raw::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// let mut waiter = mutex.waiter();
    ///
    /// let guard = waiter.lock();
    /// drop(guard);
    ///
    /// assert_eq!(mutex.is_locked(), false);
    /// ```
    #[inline]
    pub fn is_locked(&self) -> bool {
        // Relaxed is sufficient because this method only guarantees atomicity.
        self.tail.load(Relaxed) != 0
    }

    /// Returns the fairness tunables this lock was created with.
    #[inline]
    pub const fn fairness(&self) -> Fairness {
        self.fairness
    }

    /// Returns the capacity of the waiter arena.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Mutex` mutably, no actual locking needs
    /// to take place - the mutable borrow statically guarantees no locks
    /// exist.
    ///
    /// # Examples
    ///
    /// ```
    /// use cnalock::raw::spins::Mutex;
    ///
    /// let mut mutex = Mutex::new(0);
    /// *mutex.get_mut() = 10;
    ///
    /// assert_eq!(mutex.lock_with(|guard| *guard), 10);
    /// ```
    #[cfg(not(all(loom, test)))]
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: We hold exclusive access to the Mutex data.
        unsafe { &mut *self.data_ptr() }
    }

    /// Unlocks the lock if the candidate handle is the queue's tail.
    fn try_unlock(&self, handle: usize) -> bool {
        self.tail.compare_exchange(handle, 0, Release, Relaxed).is_ok()
    }

    /// Returns a reference to the slot behind an encoded handle.
    fn slot(&self, handle: usize) -> &Slot {
        &self.slots[handle - BASE]
    }

    /// Returns a raw mutable pointer to the underlying data.
    #[cfg(not(all(loom, test)))]
    pub(crate) const fn data_ptr(&self) -> *mut T {
        self.data.get()
    }

    /// Get a Loom immutable raw pointer to the underlying data.
    #[cfg(all(loom, test))]
    pub(crate) fn data_get(&self) -> ConstPtr<T> {
        self.data.get()
    }

    /// Get a Loom mutable raw pointer to the underlying data.
    #[cfg(all(loom, test))]
    pub(crate) fn data_get_mut(&self) -> MutPtr<T> {
        self.data.get_mut()
    }
}

impl<T: Default, R, P, const N: usize> Default for Mutex<T, R, P, N> {
    /// Creates a `Mutex<T, R, P, N>`, with the `Default` value for `T`.
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T, R, P, const N: usize> From<T> for Mutex<T, R, P, N> {
    /// Creates a `Mutex<T, R, P, N>` from a instance of `T`.
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<T: ?Sized + fmt::Debug, R: Relax, P: Topology, const N: usize> fmt::Debug
    for Mutex<T, R, P, N>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        self.try_lock_with(|guard| match guard {
            Some(guard) => {
                guard.data_with(|data| {
                    d.field("data", &data);
                });
            }
            None => {
                d.field("data", &format_args!("<locked>"));
            }
        });
        d.finish()
    }
}

/// A claimed slot of a lock's waiter arena.
///
/// Lock acquisition goes through a waiter: claiming one fixes the arena
/// slot whose handle will travel through the lock's tail and grant words
/// while the thread is queued. A waiter may back any number of sequential
/// acquisitions, and is typically claimed once per contending thread.
/// Dropping it returns the slot to the arena.
///
/// See [`waiter`] and [`try_waiter`] methods on [`Mutex`].
///
/// [`waiter`]: Mutex::waiter
/// [`try_waiter`]: Mutex::try_waiter
pub struct Waiter<'a, T: ?Sized, R, P, const N: usize> {
    lock: &'a Mutex<T, R, P, N>,
    index: usize,
    rng: u32,
}

impl<'a, T: ?Sized, R: Relax, P: Topology, const N: usize> Waiter<'a, T, R, P, N> {
    /// Creates a new `Waiter` owning the claimed slot at `index`.
    fn new(lock: &'a Mutex<T, R, P, N>, index: usize) -> Self {
        // Any non-zero xorshift seed will do, slots just should not share
        // one so that their filtering passes stay decorrelated.
        let rng = (index as u32 + 1).wrapping_mul(0x9E37_79B9) | 1;
        Self { lock, index, rng }
    }

    /// The encoded handle of this waiter's slot.
    const fn handle(&self) -> usize {
        self.index + BASE
    }

    /// Acquires the mutex, blocking the current thread until it is able to
    /// do so.
    ///
    /// Upon returning, the thread is the only thread with the lock held. An
    /// RAII guard is returned to allow scoped unlock of the lock; when the
    /// guard goes out of scope, the mutex will be unlocked.
    ///
    /// The only blocking point is a spin on this waiter's own arena slot,
    /// so waiting threads do not touch remote memory. Spinning applies the
    /// lock's relax policy.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// use cnalock::raw::spins::Mutex;
    ///
    /// let mutex = Arc::new(Mutex::new(0));
    /// let c_mutex = Arc::clone(&mutex);
    ///
    /// thread::spawn(move || {
    ///     let mut waiter = c_mutex.waiter();
    ///     *waiter.lock() = 10;
    /// })
    /// .join().expect("thread::spawn failed");
    ///
    /// let mut waiter = mutex.waiter();
    /// assert_eq!(*waiter.lock(), 10);
    /// ```
    pub fn lock(&mut self) -> MutexGuard<'_, T, R, P, N> {
        let lock = self.lock;
        let handle = self.handle();
        let slot = &lock.slots[self.index];
        slot.prepare::<P>();
        let pred = lock.tail.swap(handle, AcqRel);
        // If we have a predecessor, complete the link so it will notify us.
        if pred != 0 {
            lock.slot(pred).next.store(handle, Release);
            let mut relax = R::new();
            while let Grant::Pending = Grant::decode(slot.grant.load(Relaxed)) {
                relax.relax();
            }
            fence(Acquire);
        }
        self.order_queue(slot);
        MutexGuard::new(lock, self.index)
    }

    /// Attempts to acquire this mutex without blocking the thread.
    ///
    /// This is the uncontended fast path only: if the lock is already held,
    /// with or without queued waiters, [`None`] is returned rather than
    /// queueing, since a queued waiter cannot give up its place without
    /// breaking the chain for its successor.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// use cnalock::raw::spins::Mutex;
    ///
    /// let mutex = Arc::new(Mutex::new(0));
    /// let c_mutex = Arc::clone(&mutex);
    ///
    /// thread::spawn(move || {
    ///     let mut waiter = c_mutex.waiter();
    ///     if let Some(mut guard) = waiter.try_lock() {
    ///         *guard = 10;
    ///     } else {
    ///         println!("try_lock failed");
    ///     };
    /// })
    /// .join().expect("thread::spawn failed");
    ///
    /// let mut waiter = mutex.waiter();
    /// assert_eq!(*waiter.lock(), 10);
    /// ```
    pub fn try_lock(&mut self) -> Option<MutexGuard<'_, T, R, P, N>> {
        let lock = self.lock;
        let slot = &lock.slots[self.index];
        slot.prepare::<P>();
        lock.tail
            .compare_exchange(0, self.handle(), Acquire, Relaxed)
            .map(|_| MutexGuard::new(lock, self.index))
            .ok()
    }

    /// A best-effort pass over the primary queue, run right after this
    /// waiter was granted the lock, peeling locality-mismatched successors
    /// into the secondary queue until the front of the primary queue is
    /// homogeneous again.
    ///
    /// Losing any race here only costs a missed reordering opportunity,
    /// never correctness, so the pass is also skipped with high probability
    /// while no secondary queue exists, and suspended entirely once the
    /// current secondary queue is due to be flushed.
    fn order_queue(&mut self, slot: &Slot) {
        let fairness = self.lock.fairness;
        match Grant::decode(slot.grant.load(Relaxed)) {
            // An inherited queue that is due must not grow any further:
            // the next release is going to flush it.
            Grant::Queue(_) if slot.expired::<P>(fairness.flush_after) => return,
            Grant::Queue(_) => {}
            _ => {
                let mask = (1u32 << fairness.filter_shift.min(31)) - 1;
                if self.next_random() & mask != 0 {
                    return;
                }
            }
        }
        let domain = DomainId::from_raw(slot.domain.load(Relaxed));
        // Priority holders have no domain to favor.
        if domain.is_priority() {
            return;
        }
        loop {
            match self.lock.filter(slot, domain) {
                Filter::Matched | Filter::Deferred => return,
                Filter::Spliced => {}
            }
        }
    }

    /// A xorshift32 step, cheap enough for the hand-off path.
    fn next_random(&mut self) -> u32 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = x;
        x
    }
}

impl<T: ?Sized, R, P, const N: usize> Drop for Waiter<'_, T, R, P, N> {
    fn drop(&mut self) {
        self.lock.slots[self.index].claimed.store(false, Release);
    }
}

impl<T: ?Sized, R, P, const N: usize> fmt::Debug for Waiter<'_, T, R, P, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter").field("slot", &self.index).finish()
    }
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure
/// is dropped (falls out of scope), the lock will be unlocked.
///
/// The data protected by the mutex can be access through this guard via its
/// [`Deref`] and [`DerefMut`] implementations.
///
/// This structure is returned by [`lock`] and [`try_lock`] methods on
/// [`Waiter`], and given as closure argument by [`lock_with`] and
/// [`try_lock_with`] methods on [`Mutex`].
///
/// [`lock`]: Waiter::lock
/// [`try_lock`]: Waiter::try_lock
/// [`lock_with`]: Mutex::lock_with
/// [`try_lock_with`]: Mutex::try_lock_with
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized, R: Relax, P: Topology, const N: usize> {
    lock: &'a Mutex<T, R, P, N>,
    index: usize,
}

// Same unsafe impl as `std::sync::MutexGuard`.
unsafe impl<T: ?Sized + Sync, R: Relax, P: Topology, const N: usize> Sync
    for MutexGuard<'_, T, R, P, N>
{
}

impl<'a, T: ?Sized, R: Relax, P: Topology, const N: usize> MutexGuard<'a, T, R, P, N> {
    /// Creates a new `MutexGuard` instance.
    const fn new(lock: &'a Mutex<T, R, P, N>, index: usize) -> Self {
        Self { lock, index }
    }

    /// Runs `f` with an immutable reference to the wrapped value.
    pub(crate) fn data_with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&T) -> Ret,
    {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { self.lock.data.with_unchecked(f) }
    }
}

impl<T: ?Sized, R: Relax, P: Topology, const N: usize> Drop for MutexGuard<'_, T, R, P, N> {
    fn drop(&mut self) {
        self.lock.unlock(self.index);
    }
}

#[cfg(not(all(loom, test)))]
impl<T: ?Sized, R: Relax, P: Topology, const N: usize> Deref for MutexGuard<'_, T, R, P, N> {
    type Target = T;

    /// Dereferences the guard to access the underlying data.
    fn deref(&self) -> &T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &*self.lock.data_ptr() }
    }
}

#[cfg(not(all(loom, test)))]
impl<T: ?Sized, R: Relax, P: Topology, const N: usize> DerefMut for MutexGuard<'_, T, R, P, N> {
    /// Mutably dereferences the guard to access the underlying data.
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &mut *self.lock.data_ptr() }
    }
}

impl<T: ?Sized + fmt::Debug, R: Relax, P: Topology, const N: usize> fmt::Debug
    for MutexGuard<'_, T, R, P, N>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.data_with(|data| fmt::Debug::fmt(data, f))
    }
}

impl<T: ?Sized + fmt::Display, R: Relax, P: Topology, const N: usize> fmt::Display
    for MutexGuard<'_, T, R, P, N>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.data_with(|data| fmt::Display::fmt(data, f))
    }
}

/// SAFETY: A guard instance holds the lock locked, with exclusive access to
/// the underlying data.
#[cfg(all(loom, test))]
unsafe impl<'a, T: ?Sized, R: Relax, P: Topology, const N: usize> Guard<'a, T>
    for MutexGuard<'a, T, R, P, N>
{
    type Guard = Self;

    fn deref(&'a self) -> GuardDeref<'a, T, Self::Guard> {
        GuardDeref::new(self.lock.data_get())
    }

    fn deref_mut(&'a self) -> GuardDerefMut<'a, T, Self::Guard> {
        GuardDerefMut::new(self.lock.data_get_mut())
    }
}

#[cfg(all(not(loom), test))]
mod test {
    // Test suite from the Rust's Mutex implementation with minor
    // modifications since the API is not compatible with this crate
    // implementation, plus tests covering the locality machinery.
    //
    // Copyright 2014 The Rust Project Developers.
    //
    // Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
    // http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
    // <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
    // option. This file may not be copied, modified, or distributed
    // except according to those terms.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;

    use crate::relax::Yield;
    use crate::topology::{threads, DomainId, Flat};

    use super::Fairness;

    type Mutex<T> = super::Mutex<T, Yield, Flat>;
    type GroupMutex<T, const N: usize> = super::Mutex<T, Yield, threads::Threads, N>;

    #[derive(Eq, PartialEq, Debug)]
    struct NonCopy(i32);

    #[test]
    fn smoke() {
        let m = Mutex::new(());
        let mut waiter = m.waiter();
        drop(waiter.lock());
        drop(waiter.lock());
    }

    #[test]
    fn lots_and_lots() {
        static LOCK: Mutex<u32> = Mutex::new(0);

        const ITERS: u32 = 1000;
        const CONCURRENCY: u32 = 3;

        fn inc() {
            let mut waiter = LOCK.waiter();
            for _ in 0..ITERS {
                let mut g = waiter.lock();
                *g += 1;
            }
        }

        let (tx, rx) = channel();
        for _ in 0..CONCURRENCY {
            let tx2 = tx.clone();
            thread::spawn(move || {
                inc();
                tx2.send(()).unwrap();
            });
            let tx2 = tx.clone();
            thread::spawn(move || {
                inc();
                tx2.send(()).unwrap();
            });
        }

        drop(tx);
        for _ in 0..2 * CONCURRENCY {
            rx.recv().unwrap();
        }
        let mut waiter = LOCK.waiter();
        assert_eq!(*waiter.lock(), ITERS * CONCURRENCY * 2);
    }

    #[test]
    fn try_lock() {
        let m = Mutex::new(());
        let mut waiter = m.waiter();
        *waiter.try_lock().unwrap() = ();
    }

    #[test]
    fn quiesces_after_use() {
        // A used, idle lock is indistinguishable from a fresh one.
        let m = Mutex::new(0);
        let mut waiter = m.waiter();
        *waiter.lock() += 1;
        assert!(!m.is_locked());
        assert!(waiter.try_lock().is_some());
        assert!(!m.is_locked());
    }

    #[test]
    fn try_lock_fails_when_held() {
        let m = Mutex::new(0);
        let mut holder = m.waiter();
        let guard = holder.lock();
        m.try_lock_with(|guard| assert!(guard.is_none()));
        drop(guard);
        m.try_lock_with(|guard| assert!(guard.is_some()));
    }

    #[test]
    fn waiter_arena_exhaustion() {
        let m: super::Mutex<(), Yield, Flat, 2> = super::Mutex::new(());
        let first = m.try_waiter();
        let second = m.try_waiter();
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(m.try_waiter().is_none());
        drop(first);
        assert!(m.try_waiter().is_some());
        assert_eq!(m.capacity(), 2);
    }

    #[test]
    fn default_fairness() {
        let m = Mutex::new(0);
        assert_eq!(m.fairness(), Fairness::DEFAULT);
        let f = Fairness { flush_after: 0, filter_shift: 0 };
        let m = Mutex::with_fairness(0, f);
        assert_eq!(m.fairness(), f);
    }

    #[test]
    fn test_into_inner() {
        let m = Mutex::new(NonCopy(10));
        assert_eq!(m.into_inner(), NonCopy(10));
    }

    #[test]
    fn test_into_inner_drop() {
        struct Foo(Arc<AtomicUsize>);
        impl Drop for Foo {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let num_drops = Arc::new(AtomicUsize::new(0));
        let m = Mutex::new(Foo(num_drops.clone()));
        assert_eq!(num_drops.load(Ordering::SeqCst), 0);
        {
            let _inner = m.into_inner();
            assert_eq!(num_drops.load(Ordering::SeqCst), 0);
        }
        assert_eq!(num_drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_mut() {
        let mut m = Mutex::new(NonCopy(10));
        *m.get_mut() = NonCopy(20);
        assert_eq!(m.into_inner(), NonCopy(20));
    }

    #[test]
    fn test_mutex_debug() {
        let m = Mutex::new(42);
        assert_eq!(format!("{m:?}"), "Mutex { data: 42 }");
        let mut waiter = m.waiter();
        let guard = waiter.lock();
        assert_eq!(format!("{m:?}"), "Mutex { data: <locked> }");
        drop(guard);
    }

    #[test]
    fn test_lock_arc_nested() {
        // Tests nested locks and access
        // to underlying data.
        let arc = Arc::new(Mutex::new(1));
        let arc2 = Arc::new(Mutex::new(arc));
        let (tx, rx) = channel();
        let _t = thread::spawn(move || {
            let mut waiter1 = arc2.waiter();
            let lock = waiter1.lock();
            let mut waiter2 = lock.waiter();
            let lock2 = waiter2.lock();
            assert_eq!(*lock2, 1);
            tx.send(()).unwrap();
        });
        rx.recv().unwrap();
    }

    #[test]
    fn test_acquire_more_than_one_lock() {
        let arc = Arc::new(Mutex::new(1));
        let (tx, rx) = channel();
        for _ in 0..4 {
            let tx2 = tx.clone();
            let c_arc = Arc::clone(&arc);
            let _t = thread::spawn(move || {
                let mutex = Mutex::new(1);
                let mut waiter1 = c_arc.waiter();
                let _lock = waiter1.lock();
                let mut waiter2 = mutex.waiter();
                let lock2 = waiter2.lock();
                assert_eq!(*lock2, 1);
                tx2.send(()).unwrap();
            });
        }
        drop(tx);
        rx.recv().unwrap();
    }

    #[test]
    fn test_lock_arc_access_in_unwind() {
        let arc = Arc::new(Mutex::new(1));
        let arc2 = arc.clone();
        let _ = thread::spawn(move || -> () {
            struct Unwinder {
                i: Arc<Mutex<i32>>,
            }
            impl Drop for Unwinder {
                fn drop(&mut self) {
                    let mut waiter = self.i.waiter();
                    *waiter.lock() += 1;
                }
            }
            let _u = Unwinder { i: arc2 };
            panic!();
        })
        .join();
        let mut waiter = arc.waiter();
        let lock = waiter.lock();
        assert_eq!(*lock, 2);
    }

    #[test]
    fn test_lock_unsized() {
        let lock: &Mutex<[i32]> = &Mutex::new([1, 2, 3]);
        {
            let mut waiter = lock.waiter();
            let b = &mut *waiter.lock();
            b[0] = 4;
            b[2] = 5;
        }
        let comp: &[i32] = &[4, 2, 5];
        let mut waiter = lock.waiter();
        assert_eq!(&*waiter.lock(), comp);
    }

    fn grouped_increments<const N: usize>(
        lock: &'static GroupMutex<u32, N>,
        domains: u32,
        threads_per_domain: u32,
        iters: u32,
    ) -> u32 {
        let (tx, rx) = channel();
        for domain in 0..domains {
            for _ in 0..threads_per_domain {
                let tx2 = tx.clone();
                thread::spawn(move || {
                    threads::set_domain(DomainId::new(domain));
                    let mut waiter = lock.waiter();
                    for _ in 0..iters {
                        *waiter.lock() += 1;
                    }
                    tx2.send(()).unwrap();
                });
            }
        }
        drop(tx);
        while rx.recv().is_ok() {}
        let mut waiter = lock.waiter();
        let total = *waiter.lock();
        total
    }

    #[test]
    fn two_domains_always_filtering() {
        // Zero flush window and zero filter shift drive the filter and
        // flush paths on every hand-off.
        static LOCK: GroupMutex<u32, 16> =
            super::Mutex::with_fairness(0, Fairness { flush_after: 0, filter_shift: 0 });
        let total = grouped_increments(&LOCK, 2, 3, 500);
        assert_eq!(total, 2 * 3 * 500);
    }

    #[test]
    fn domains_with_long_window() {
        static LOCK: GroupMutex<u32, 16> =
            super::Mutex::with_fairness(0, Fairness { flush_after: 200_000, filter_shift: 1 });
        let total = grouped_increments(&LOCK, 3, 2, 500);
        assert_eq!(total, 3 * 2 * 500);
    }

    #[test]
    fn priority_threads_mix_with_domains() {
        static LOCK: GroupMutex<u32, 16> =
            super::Mutex::with_fairness(0, Fairness { flush_after: 0, filter_shift: 0 });
        let (tx, rx) = channel();
        for group in 0..4u32 {
            let tx2 = tx.clone();
            thread::spawn(move || {
                // Group 3 never assigns a domain and stays priority.
                if group < 3 {
                    threads::set_domain(DomainId::new(group));
                }
                let mut waiter = LOCK.waiter();
                for _ in 0..500 {
                    *waiter.lock() += 1;
                }
                tx2.send(()).unwrap();
            });
        }
        drop(tx);
        while rx.recv().is_ok() {}
        let mut waiter = LOCK.waiter();
        assert_eq!(*waiter.lock(), 4 * 500);
    }
}

#[cfg(all(loom, test))]
mod test {
    use core::cell::Cell;

    use loom::{model, thread};

    use crate::loom::Guard;
    use crate::relax::Yield;
    use crate::topology::{DomainId, Flat, Topology};

    use super::Fairness;

    type Mutex<T> = super::Mutex<T, Yield, Flat, 4>;

    #[test]
    fn threads_join() {
        use core::ops::Range;
        use loom::sync::Arc;

        fn inc(lock: Arc<Mutex<i32>>) {
            let mut waiter = lock.waiter();
            let guard = waiter.lock();
            *guard.deref_mut() += 1;
        }

        model(|| {
            let data = Arc::new(Mutex::new(0));
            // 3 or more threads make this model run for too long.
            let runs @ Range { end, .. } = 0..2;

            let handles = runs
                .into_iter()
                .map(|_| Arc::clone(&data))
                .map(|data| thread::spawn(move || inc(data)))
                .collect::<Vec<_>>();

            for handle in handles {
                handle.join().unwrap();
            }

            let mut waiter = data.waiter();
            assert_eq!(end, *waiter.lock().deref());
        });
    }

    #[test]
    fn threads_fork() {
        // Using std's Arc or else this model runs for too long.
        use std::sync::Arc;

        fn inc(lock: Arc<Mutex<i32>>) {
            let mut waiter = lock.waiter();
            let guard = waiter.lock();
            *guard.deref_mut() += 1;
        }

        model(|| {
            let data = Arc::new(Mutex::new(0));
            // 4 or more threads make this model run for too long.
            for _ in 0..3 {
                let data = Arc::clone(&data);
                thread::spawn(move || inc(data));
            }
        });
    }

    #[test]
    fn try_lock_join() {
        use loom::sync::Arc;

        fn try_inc(lock: Arc<Mutex<i32>>) {
            let mut waiter = lock.waiter();
            if let Some(guard) = waiter.try_lock() {
                *guard.deref_mut() += 1;
            }
        }

        model(|| {
            let data = Arc::new(Mutex::new(0));
            let handles = (0..2)
                .map(|_| Arc::clone(&data))
                .map(|data| thread::spawn(move || try_inc(data)))
                .collect::<Vec<_>>();

            for handle in handles {
                handle.join().unwrap();
            }

            let mut waiter = data.waiter();
            let value = *waiter.lock().deref();
            assert!((1..=2).contains(&value));
        });
    }

    loom::thread_local! {
        static DOMAIN: Cell<u32> = Cell::new(u32::MAX);
    }

    /// Per-model-thread domain assignment with a clock that never advances,
    /// so that a zero flush window expires immediately.
    struct Local;

    impl Topology for Local {
        fn domain() -> DomainId {
            DomainId::from_raw(DOMAIN.with(Cell::get))
        }

        fn timestamp() -> u64 {
            0
        }
    }

    #[test]
    fn threads_fork_two_domains() {
        // Using std's Arc or else this model runs for too long.
        use std::sync::Arc;

        type DomainMutex = super::Mutex<i32, Yield, Local, 4>;

        fn inc(lock: Arc<DomainMutex>, domain: u32) {
            DOMAIN.with(|cell| cell.set(domain));
            let mut waiter = lock.waiter();
            let guard = waiter.lock();
            *guard.deref_mut() += 1;
        }

        model(|| {
            // Always filter and always flush, so that a three thread
            // interleaving can drive the splice paths.
            let fairness = Fairness { flush_after: 0, filter_shift: 0 };
            let data = Arc::new(DomainMutex::with_fairness(0, fairness));
            for run in 0..3u32 {
                let data = Arc::clone(&data);
                thread::spawn(move || inc(data, run % 2));
            }
        });
    }
}
