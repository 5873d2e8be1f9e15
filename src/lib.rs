//! A simple and correct implementation of the compact NUMA-aware (CNA) lock,
//! after the design by Dave Dice and Alex Kogan, and the Linux kernel's
//! qspinlock CNA patch series.
//!
//! The CNA lock is an MCS-style queue lock: contending threads form a queue
//! where each waiter spins on its own, locally-accessible slot, and the lock
//! is passed down the queue in order. On multi-socket machines, passing the
//! lock to a waiter on another socket moves the protected data across the
//! interconnect. The CNA protocol has the lock holder reorder the queue so
//! that waiters from its own locality domain are served back to back,
//! parking mismatched waiters on a secondary queue that is guaranteed to be
//! spliced back within a configurable time window, so no waiter starves.
//!
//! The lock is unfair in the short term (by design) and fair in the long
//! term. With the [`Flat`] topology it degenerates into a plain, strictly
//! FIFO MCS lock, which is also the right choice on single-socket machines.
//!
//! # Waiters
//!
//! Queued waiters spin on slots of a fixed arena embedded in the lock, so
//! the lock itself needs no allocation and works without `alloc`. Threads
//! claim a slot through [`Mutex::waiter`] (typically once, at thread
//! start-up) and acquire the lock through it any number of times:
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use cnalock::raw::spins::Mutex;
//!
//! let mutex = Arc::new(Mutex::new(0));
//! let c_mutex = Arc::clone(&mutex);
//!
//! thread::spawn(move || {
//!     let mut waiter = c_mutex.waiter();
//!     *waiter.lock() = 10;
//! })
//! .join().expect("thread::spawn failed");
//!
//! let mut waiter = mutex.waiter();
//! assert_eq!(*waiter.lock(), 10);
//! ```
//!
//! # Locality domains
//!
//! Locks are generic over a [`Topology`] policy that classifies the calling
//! thread into a locality domain on every acquisition. Two classifications
//! ship with the crate: explicit per-thread assignment (the `thread_local`
//! feature) and the NUMA node of the current CPU (the `numa` feature, Linux
//! only). Custom classifications are a trait implementation away:
//!
//! ```
//! use cnalock::raw::Mutex;
//! use cnalock::relax::Spin;
//! use cnalock::topology::{DomainId, Topology};
//!
//! struct Sockets;
//!
//! impl Topology for Sockets {
//!     fn domain() -> DomainId {
//!         // E.g. the socket the current thread is pinned to.
//!         DomainId::new(0)
//!     }
//!
//!     fn timestamp() -> u64 {
//!         // Consumed by the fairness window; any monotonic nanosecond
//!         // clock will do.
//!         0
//!     }
//! }
//!
//! type SocketMutex<T> = Mutex<T, Spin, Sockets>;
//!
//! let mutex: SocketMutex<i32> = SocketMutex::new(0);
//! let mut waiter = mutex.waiter();
//! assert_eq!(*waiter.lock(), 0);
//! ```
//!
//! # Features
//!
//! This crate is `no_std` by default. The following features are available:
//!
//! - `yield`: enables the [`Yield`] and [`YieldBackoff`] relax strategies,
//!   which link to the standard library.
//! - `thread_local`: enables the [`topology::threads`] module for explicit
//!   per-thread domain assignment (requires `std`).
//! - `numa`: enables the [`topology::numa`] module, classifying threads by
//!   the NUMA node of their current CPU (requires `std`, Linux only).
//!
//! # Related papers and implementations
//!
//! - Dice, D., Kogan, A.: Compact NUMA-aware Locks, EuroSys '19.
//!   <https://arxiv.org/abs/1810.05600>
//! - The Linux kernel qspinlock CNA patch series.
//!   <https://lore.kernel.org/lkml/20210514200743.3026725-1-alex.kogan@oracle.com/>
//! - Mellor-Crummey, J., Scott, M.: Algorithms for Scalable Synchronization
//!   on Shared-Memory Multiprocessors, ACM TOCS '91.
//!
//! [`Flat`]: crate::topology::Flat
//! [`Topology`]: crate::topology::Topology
//! [`Mutex::waiter`]: crate::raw::Mutex::waiter
//! [`Yield`]: crate::relax::Yield
//! [`YieldBackoff`]: crate::relax::YieldBackoff

#![cfg_attr(
    all(
        not(feature = "yield"),
        not(feature = "thread_local"),
        not(feature = "numa"),
        not(loom),
        not(test)
    ),
    no_std
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rust_2021_compatibility)]
#![allow(clippy::doc_markdown)]

pub mod raw;
pub mod relax;
pub mod topology;

pub(crate) mod cfg;

#[cfg(all(loom, test))]
pub(crate) mod loom;
