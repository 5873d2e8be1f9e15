// The relax strategies are a modified version of relax.rs from spin-rs,
// and the exponential backoff is based on the crossbeam-utils implementation.
//
// spin-rs:
// https://github.com/mvdnes/spin-rs/blob/master/src/relax.rs
//
// Copyright (c) 2014 Mathijs van de Nes
//
// crossbeam-utils:
// https://github.com/crossbeam-rs/crossbeam/blob/master/crossbeam-utils/src/backoff.rs
//
// Copyright (c) 2019 The Crossbeam Project Developers
//
// Both licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! Strategies that determine the behaviour of locks when encountering contention.

/// A trait implemented by spinning relax strategies.
pub trait Relax {
    /// Initialize the state for the relaxing operation, if any.
    fn new() -> Self;

    /// Perform the relaxing operation during a period of contention.
    fn relax(&mut self);
}

/// A strategy that rapidly spins while informing the CPU that it should power
/// down non-essential components via [`core::hint::spin_loop`].
///
/// Note that spinning is a 'dumb' strategy and most schedulers cannot
/// correctly differentiate it from useful work, thereby misallocating even
/// more CPU time to the spinning process. This is known as [priority
/// inversion]. If you see signs of it, consider switching to [`Yield`] or,
/// better, a scheduler-aware lock.
///
/// [priority inversion]: https://matklad.github.io/2020/01/02/spinlocks-considered-harmful.html
pub struct Spin;

impl Relax for Spin {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        core::hint::spin_loop();
    }
}

/// A strategy that yields the current time slice to the scheduler in favour
/// of other threads or processes.
///
/// This is generally used as a strategy for minimising power consumption and
/// priority inversion on targets that have a standard library available.
#[cfg(any(feature = "yield", loom, test))]
#[cfg_attr(docsrs, doc(cfg(feature = "yield")))]
pub struct Yield;

#[cfg(all(any(feature = "yield", test), not(loom)))]
impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline]
    fn relax(&mut self) {
        std::thread::yield_now();
    }
}

/// When running Loom models, we must call Loom's `yield_now` to tell Loom that
/// another thread needs to be scheduled in order for the current one to make
/// progress.
#[cfg(all(loom, test))]
impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        loom::thread::yield_now();
    }
}

/// A strategy that rapidly spins, without telling the CPU to do any powering
/// down.
///
/// You almost certainly do not want to use this. Use [`Spin`] instead. It
/// exists for targets that miscompile or do not support spin hint intrinsics
/// despite attempting to generate code for them.
pub struct Loop;

impl Relax for Loop {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {}
}

/// A strategy that, as [`Spin`], will run a busy-wait spin-loop, except this
/// implementation will perform exponential backoff.
///
/// Backing off in spin loops can reduce contention and improve overall
/// performance for some use cases. Further profiling is important to measure
/// any significant improvement.
pub struct SpinBackoff {
    step: Step,
}

impl SpinBackoff {
    const SPIN_LIMIT: u32 = 6;
}

impl Relax for SpinBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { step: Step(0) }
    }

    #[inline(always)]
    fn relax(&mut self) {
        self.step.spin_to(Self::SPIN_LIMIT);
        self.step.step_to(Self::SPIN_LIMIT);
    }
}

/// A strategy that, as [`Yield`], will yield back to the OS scheduler, but
/// only after performing exponential backoff in a spin loop within a
/// threshold.
#[cfg(feature = "yield")]
#[cfg_attr(docsrs, doc(cfg(feature = "yield")))]
pub struct YieldBackoff {
    step: Step,
}

#[cfg(feature = "yield")]
impl YieldBackoff {
    const SPIN_LIMIT: u32 = SpinBackoff::SPIN_LIMIT;
    const YIELD_LIMIT: u32 = 10;
}

#[cfg(feature = "yield")]
impl Relax for YieldBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { step: Step(0) }
    }

    #[inline(always)]
    fn relax(&mut self) {
        if self.step.0 <= Self::SPIN_LIMIT {
            self.step.spin();
        } else {
            std::thread::yield_now();
        }
        self.step.step_to(Self::YIELD_LIMIT);
    }
}

/// Keeps count of the number of steps taken.
struct Step(u32);

impl Step {
    /// Unbounded backoff spinning.
    #[cfg(feature = "yield")]
    fn spin(&self) {
        for _ in 0..1 << self.0 {
            core::hint::spin_loop();
        }
    }

    /// Bounded backoff spinning.
    fn spin_to(&self, max: u32) {
        for _ in 0..1 << self.0.min(max) {
            core::hint::spin_loop();
        }
    }

    /// Bounded step increment.
    fn step_to(&mut self, end: u32) {
        if self.0 <= end {
            self.0 += 1;
        }
    }
}
