#![cfg(not(loom))]

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Instant;

use cnalock::raw::{Fairness, Mutex};
use cnalock::relax::Relax;
use cnalock::topology::{DomainId, Topology};

struct Yield;

impl Relax for Yield {
    fn new() -> Self {
        Self
    }

    fn relax(&mut self) {
        thread::yield_now();
    }
}

thread_local! {
    static GROUP: Cell<DomainId> = Cell::new(DomainId::PRIORITY);
}

struct Groups;

impl Topology for Groups {
    fn domain() -> DomainId {
        GROUP.with(Cell::get)
    }

    fn timestamp() -> u64 {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

fn set_group(id: u32) {
    GROUP.with(|cell| cell.set(DomainId::new(id)));
}

type GroupMutex<T> = Mutex<T, Yield, Groups, 64>;

/// Not a single increment may be lost across domains, with a zero flush
/// window driving the filter and flush paths on every hand-off.
#[test]
fn counter_under_heavy_grouped_contention() {
    const DOMAINS: u32 = 4;
    const THREADS_PER_DOMAIN: u32 = 4;
    const ITERS: u64 = 10_000;

    let fairness = Fairness { flush_after: 0, filter_shift: 0 };
    let lock = Arc::new(GroupMutex::with_fairness(0u64, fairness));

    let handles: Vec<_> = (0..DOMAINS)
        .flat_map(|domain| (0..THREADS_PER_DOMAIN).map(move |_| domain))
        .map(|domain| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                set_group(domain);
                let mut waiter = lock.waiter();
                for _ in 0..ITERS {
                    *waiter.lock() += 1;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread::spawn failed");
    }

    let mut waiter = lock.waiter();
    let total = u64::from(DOMAINS * THREADS_PER_DOMAIN) * ITERS;
    assert_eq!(*waiter.lock(), total);
}

/// At most one thread is ever inside the critical section, whatever the
/// queue reordering does.
#[test]
fn critical_section_is_exclusive() {
    const THREADS: u32 = 8;
    const ITERS: u32 = 2000;

    let lock = Arc::new(GroupMutex::new(0u64));
    let inside = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|thread_nr| {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                set_group(thread_nr % 2);
                let mut waiter = lock.waiter();
                for _ in 0..ITERS {
                    let mut guard = waiter.lock();
                    let occupants = inside.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(occupants, 0, "critical section was not exclusive");
                    *guard += 1;
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread::spawn failed");
    }

    let mut waiter = lock.waiter();
    assert_eq!(*waiter.lock(), u64::from(THREADS * ITERS));
}

/// With filtering active and a long flush window, hand-offs within one
/// group cluster together instead of ping-ponging between groups.
#[test]
fn same_group_hand_offs_cluster() {
    const GROUPS: u32 = 2;
    const THREADS_PER_GROUP: u32 = 3;
    const ITERS: usize = 2000;

    let fairness = Fairness { flush_after: 100_000_000, filter_shift: 0 };
    let lock = Arc::new(GroupMutex::with_fairness(Vec::new(), fairness));

    let handles: Vec<_> = (0..GROUPS)
        .flat_map(|group| (0..THREADS_PER_GROUP).map(move |_| group))
        .map(|group| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                set_group(group);
                let mut waiter = lock.waiter();
                for _ in 0..ITERS {
                    waiter.lock().push(group);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread::spawn failed");
    }

    let mut waiter = lock.waiter();
    let entries = waiter.lock();
    let total = (GROUPS * THREADS_PER_GROUP) as usize * ITERS;
    assert_eq!(entries.len(), total);
    let clustered = entries.windows(2).filter(|pair| pair[0] == pair[1]).count();
    // A loose floor: reordering (and plain thread burstiness) keeps entries
    // of one group overwhelmingly adjacent.
    assert!(clustered >= total / 3, "only {clustered} of {total} hand-offs were clustered");
}

/// Interleaved blocking and non-blocking acquisitions agree on the final
/// count.
#[test]
fn mixed_lock_and_try_lock() {
    const THREADS: u32 = 6;
    const ITERS: u32 = 3000;

    let lock = Arc::new(GroupMutex::new(0u64));
    let expected = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|thread_nr| {
            let lock = Arc::clone(&lock);
            let expected = Arc::clone(&expected);
            thread::spawn(move || {
                set_group(thread_nr % 3);
                let mut waiter = lock.waiter();
                let mut acquired = 0;
                for iter in 0..ITERS {
                    if iter % 7 == 0 {
                        if let Some(mut guard) = waiter.try_lock() {
                            *guard += 1;
                            acquired += 1;
                        }
                    } else {
                        *waiter.lock() += 1;
                        acquired += 1;
                    }
                }
                expected.fetch_add(acquired, Ordering::Relaxed);
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread::spawn failed");
    }

    let mut waiter = lock.waiter();
    assert_eq!(*waiter.lock(), expected.load(Ordering::Relaxed));
}
