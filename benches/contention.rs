use std::cell::Cell;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion};

use cnalock::raw::{spins, Fairness, Mutex};
use cnalock::relax::{Relax, Spin};
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

type GroupMutex<T> = Mutex<T, Yield, Groups, 64>;

fn uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended");

    group.bench_function("lock_unlock", |b| {
        let mutex = spins::Mutex::new(0u64);
        let mut waiter = mutex.waiter();
        b.iter(|| {
            *waiter.lock() += 1;
        });
    });

    group.bench_function("try_lock_unlock", |b| {
        let mutex = spins::Mutex::new(0u64);
        let mut waiter = mutex.waiter();
        b.iter(|| {
            if let Some(mut guard) = waiter.try_lock() {
                *guard += 1;
            }
        });
    });

    group.bench_function("grouped_lock_unlock", |b| {
        let mutex: Mutex<u64, Spin, Groups, 64> = Mutex::new(0);
        let mut waiter = mutex.waiter();
        b.iter(|| {
            *waiter.lock() += 1;
        });
    });

    group.finish();
}

fn contended(c: &mut Criterion) {
    const THREADS: u32 = 4;
    const ITERS: u64 = 1000;

    fn run<F: Fn(u32) -> u32 + Copy + Send + 'static>(lock: &Arc<GroupMutex<u64>>, group_of: F) {
        let handles: Vec<_> = (0..THREADS)
            .map(|thread_nr| {
                let lock = Arc::clone(lock);
                thread::spawn(move || {
                    GROUP.with(|cell| cell.set(DomainId::new(group_of(thread_nr))));
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
    }

    let mut group = c.benchmark_group("contended");
    group.sample_size(10);

    group.bench_function("single_domain", |b| {
        b.iter(|| {
            let lock = Arc::new(GroupMutex::new(0));
            run(&lock, |_| 0);
        });
    });

    group.bench_function("two_domains", |b| {
        b.iter(|| {
            let lock = Arc::new(GroupMutex::new(0));
            run(&lock, |thread_nr| thread_nr % 2);
        });
    });

    group.bench_function("two_domains_always_flushing", |b| {
        b.iter(|| {
            let fairness = Fairness { flush_after: 0, filter_shift: 0 };
            let lock = Arc::new(GroupMutex::with_fairness(0, fairness));
            run(&lock, |thread_nr| thread_nr % 2);
        });
    });

    group.finish();
}

criterion_group!(benches, uncontended, contended);
criterion_main!(benches);
