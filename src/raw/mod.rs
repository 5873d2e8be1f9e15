//! A compact NUMA-aware lock for exclusive access, with waiters spinning on
//! arena slots of the lock itself.
//!
//! Waiters claim a slot of the lock's fixed arena (see [`Waiter`]) and then
//! spin on it while enqueued, so that lock hand-off only ever moves one cache
//! line. The lock holder additionally reorders the wait queue so that
//! waiters of its own locality domain run back to back, within the fairness
//! bounds set by [`Fairness`]. The locality classification is selected at
//! the type level through the [`topology`] module, and the busy-wait
//! behaviour through the [`relax`] module.
//!
//! The policy alias modules below fix the relax strategy and default to the
//! [`Flat`] topology; locks over a real topology spell out the full
//! [`Mutex`] type instead.
//!
//! [`relax`]: crate::relax
//! [`topology`]: crate::topology
//! [`Flat`]: crate::topology::Flat

mod mutex;
pub use mutex::{Fairness, Mutex, MutexGuard, Waiter};

/// A CNA lock that implements the [`Spin`] relax strategy and the [`Flat`]
/// topology.
///
/// [`Spin`]: crate::relax::Spin
/// [`Flat`]: crate::topology::Flat
pub mod spins {
    use crate::relax::Spin;
    use crate::topology::Flat;

    use super::mutex;

    /// A raw CNA mutex that implements the [`Spin`] relax strategy.
    ///
    /// # Example
    ///
    /// ```
    /// use cnalock::raw::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// let mut waiter = mutex.waiter();
    /// *waiter.lock() = 10;
    /// assert_eq!(*waiter.lock(), 10);
    /// ```
    /// [`Spin`]: crate::relax::Spin
    pub type Mutex<T> = mutex::Mutex<T, Spin, Flat>;

    /// A raw CNA mutex guard that implements the [`Spin`] relax strategy.
    ///
    /// [`Spin`]: crate::relax::Spin
    pub type MutexGuard<'a, T> = mutex::MutexGuard<'a, T, Spin, Flat, 32>;

    /// A CNA lock that implements the [`SpinBackoff`] relax strategy and the
    /// [`Flat`] topology.
    ///
    /// [`SpinBackoff`]: crate::relax::SpinBackoff
    /// [`Flat`]: crate::topology::Flat
    pub mod backoff {
        use crate::relax::SpinBackoff;
        use crate::topology::Flat;

        use super::mutex;

        /// A raw CNA mutex that implements the [`SpinBackoff`] relax
        /// strategy.
        ///
        /// # Example
        ///
        /// ```
        /// use cnalock::raw::spins::backoff::Mutex;
        ///
        /// let mutex = Mutex::new(0);
        /// let mut waiter = mutex.waiter();
        /// *waiter.lock() = 10;
        /// assert_eq!(*waiter.lock(), 10);
        /// ```
        /// [`SpinBackoff`]: crate::relax::SpinBackoff
        pub type Mutex<T> = mutex::Mutex<T, SpinBackoff, Flat>;

        /// A raw CNA mutex guard that implements the [`SpinBackoff`] relax
        /// strategy.
        ///
        /// [`SpinBackoff`]: crate::relax::SpinBackoff
        pub type MutexGuard<'a, T> = mutex::MutexGuard<'a, T, SpinBackoff, Flat, 32>;
    }
}

/// A CNA lock that implements the [`Yield`] relax strategy and the [`Flat`]
/// topology.
///
/// [`Yield`]: crate::relax::Yield
/// [`Flat`]: crate::topology::Flat
#[cfg(any(feature = "yield", loom, test))]
#[cfg_attr(docsrs, doc(cfg(feature = "yield")))]
pub mod yields {
    use crate::relax::Yield;
    use crate::topology::Flat;

    use super::mutex;

    /// A raw CNA mutex that implements the [`Yield`] relax strategy.
    ///
    /// # Example
    ///
    /// ```
    /// use cnalock::raw::yields::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// let mut waiter = mutex.waiter();
    /// *waiter.lock() = 10;
    /// assert_eq!(*waiter.lock(), 10);
    /// ```
    /// [`Yield`]: crate::relax::Yield
    pub type Mutex<T> = mutex::Mutex<T, Yield, Flat>;

    /// A raw CNA mutex guard that implements the [`Yield`] relax strategy.
    ///
    /// [`Yield`]: crate::relax::Yield
    pub type MutexGuard<'a, T> = mutex::MutexGuard<'a, T, Yield, Flat, 32>;

    /// A CNA lock that implements the [`YieldBackoff`] relax strategy and
    /// the [`Flat`] topology.
    ///
    /// [`YieldBackoff`]: crate::relax::YieldBackoff
    /// [`Flat`]: crate::topology::Flat
    #[cfg(feature = "yield")]
    pub mod backoff {
        use crate::relax::YieldBackoff;
        use crate::topology::Flat;

        use super::mutex;

        /// A raw CNA mutex that implements the [`YieldBackoff`] relax
        /// strategy.
        ///
        /// # Example
        ///
        /// ```
        /// use cnalock::raw::yields::backoff::Mutex;
        ///
        /// let mutex = Mutex::new(0);
        /// let mut waiter = mutex.waiter();
        /// *waiter.lock() = 10;
        /// assert_eq!(*waiter.lock(), 10);
        /// ```
        /// [`YieldBackoff`]: crate::relax::YieldBackoff
        pub type Mutex<T> = mutex::Mutex<T, YieldBackoff, Flat>;

        /// A raw CNA mutex guard that implements the [`YieldBackoff`] relax
        /// strategy.
        ///
        /// [`YieldBackoff`]: crate::relax::YieldBackoff
        pub type MutexGuard<'a, T> = mutex::MutexGuard<'a, T, YieldBackoff, Flat, 32>;
    }
}

/// A CNA lock that implements the [`Loop`] relax strategy and the [`Flat`]
/// topology.
///
/// [`Loop`]: crate::relax::Loop
/// [`Flat`]: crate::topology::Flat
pub mod loops {
    use crate::relax::Loop;
    use crate::topology::Flat;

    use super::mutex;

    /// A raw CNA mutex that implements the [`Loop`] relax strategy.
    ///
    /// # Example
    ///
    /// ```
    /// use cnalock::raw::loops::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// let mut waiter = mutex.waiter();
    /// *waiter.lock() = 10;
    /// assert_eq!(*waiter.lock(), 10);
    /// ```
    /// [`Loop`]: crate::relax::Loop
    pub type Mutex<T> = mutex::Mutex<T, Loop, Flat>;

    /// A raw CNA mutex guard that implements the [`Loop`] relax strategy.
    ///
    /// [`Loop`]: crate::relax::Loop
    pub type MutexGuard<'a, T> = mutex::MutexGuard<'a, T, Loop, Flat, 32>;
}
