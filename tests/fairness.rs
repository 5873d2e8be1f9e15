#![cfg(not(loom))]

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

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

/// Explicit per-thread grouping with the process monotonic clock, standing
/// in for a hardware topology.
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

/// A minority-domain waiter keeps acquiring the lock while a majority domain
/// hammers it. The flush window guarantees it is reconsidered on every
/// window expiry, so it must make progress.
#[test]
fn minority_domain_is_not_starved() {
    const MAJORITY: u32 = 4;
    const MINORITY_ACQUISITIONS: u64 = 200;

    let lock = Arc::new(GroupMutex::new(0u64));
    let stop = Arc::new(AtomicBool::new(false));
    let majority_total = Arc::new(AtomicU64::new(0));

    let majority: Vec<_> = (0..MAJORITY)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let stop = Arc::clone(&stop);
            let total = Arc::clone(&majority_total);
            thread::spawn(move || {
                set_group(0);
                let mut waiter = lock.waiter();
                let mut count = 0;
                while !stop.load(Ordering::Relaxed) {
                    *waiter.lock() += 1;
                    count += 1;
                }
                total.fetch_add(count, Ordering::Relaxed);
            })
        })
        .collect();

    let minority = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            set_group(1);
            let mut waiter = lock.waiter();
            for _ in 0..MINORITY_ACQUISITIONS {
                *waiter.lock() += 1;
            }
        })
    };

    // Hangs here if the minority waiter can starve.
    minority.join().expect("thread::spawn failed");
    stop.store(true, Ordering::Relaxed);
    for handle in majority {
        handle.join().expect("thread::spawn failed");
    }

    let mut waiter = lock.waiter();
    let total = *waiter.lock();
    assert_eq!(total, majority_total.load(Ordering::Relaxed) + MINORITY_ACQUISITIONS);
}

/// Every single acquisition from the minority domain completes well within a
/// few flush windows, even while the majority domain keeps the lock maximally
/// contended. The bound is orders of magnitude above the window to stay
/// robust on slow or oversubscribed machines.
#[test]
fn cross_domain_wait_is_bounded() {
    const WINDOW: Duration = Duration::from_millis(1);
    const BOUND: Duration = Duration::from_secs(5);

    let fairness = Fairness { flush_after: WINDOW.as_nanos() as u64, filter_shift: 0 };
    let lock = Arc::new(GroupMutex::with_fairness(0u64, fairness));
    let stop = Arc::new(AtomicBool::new(false));

    let majority: Vec<_> = (0..4)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                set_group(0);
                let mut waiter = lock.waiter();
                while !stop.load(Ordering::Relaxed) {
                    *waiter.lock() += 1;
                }
            })
        })
        .collect();

    let worst = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            set_group(1);
            let mut waiter = lock.waiter();
            let mut worst = Duration::ZERO;
            for _ in 0..50 {
                let queued = Instant::now();
                let guard = waiter.lock();
                worst = worst.max(queued.elapsed());
                drop(guard);
            }
            worst
        })
        .join()
        .expect("thread::spawn failed")
    };

    stop.store(true, Ordering::Relaxed);
    for handle in majority {
        handle.join().expect("thread::spawn failed");
    }

    assert!(worst < BOUND, "worst cross-domain wait was {worst:?}");
}

/// Waiters of the same domain are granted the lock in the order they
/// enqueued.
#[test]
fn same_domain_hand_off_is_fifo() {
    let lock = Arc::new(GroupMutex::new(Vec::new()));
    let (ready_tx, ready_rx) = channel();

    let holder = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            set_group(0);
            let mut waiter = lock.waiter();
            let guard = waiter.lock();
            ready_tx.send(()).expect("channel closed");
            // Keep the lock held long enough for both waiters to enqueue,
            // in order, behind us.
            thread::sleep(Duration::from_millis(500));
            drop(guard);
        })
    };

    ready_rx.recv().expect("channel closed");
    let waiters: Vec<_> = ["first", "second"]
        .into_iter()
        .map(|name| {
            let lock = Arc::clone(&lock);
            let handle = thread::spawn(move || {
                set_group(0);
                let mut waiter = lock.waiter();
                waiter.lock().push(name);
            });
            // Stagger the enqueues.
            thread::sleep(Duration::from_millis(200));
            handle
        })
        .collect();

    holder.join().expect("thread::spawn failed");
    for handle in waiters {
        handle.join().expect("thread::spawn failed");
    }

    let mut waiter = lock.waiter();
    assert_eq!(*waiter.lock(), ["first", "second"]);
}

/// Priority threads keep making progress alongside grouped ones, and are
/// never parked on a secondary queue.
#[test]
fn priority_threads_complete() {
    let fairness = Fairness { flush_after: 0, filter_shift: 0 };
    let lock = Arc::new(GroupMutex::with_fairness(0u64, fairness));

    let handles: Vec<_> = (0..6u32)
        .map(|thread_nr| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                // Two of the six threads stay in the priority domain.
                if thread_nr < 4 {
                    set_group(thread_nr % 2);
                }
                let mut waiter = lock.waiter();
                for _ in 0..1000 {
                    *waiter.lock() += 1;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread::spawn failed");
    }

    let mut waiter = lock.waiter();
    assert_eq!(*waiter.lock(), 6 * 1000);
}
