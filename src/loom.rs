use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use loom::cell::{ConstPtr, MutPtr};

/// A trait for guard types that hold a lock locked and access the protected
/// data behind Loom's `UnsafeCell` pointers.
///
/// # Safety
///
/// Implementers must guarantee that an instance of the guard holds the lock
/// locked and is the only access point to the underlying data through all
/// its lifetime.
pub unsafe trait Guard<'a, T: ?Sized + 'a>: Sized {
    /// The guard type that the Loom pointers are bounded by.
    type Guard: Guard<'a, T>;

    /// Returns a Loom immutable pointer bounded by this guard's borrow.
    fn deref(&'a self) -> GuardDeref<'a, T, Self::Guard>;

    /// Returns a Loom mutable pointer bounded by this guard's borrow.
    fn deref_mut(&'a self) -> GuardDerefMut<'a, T, Self::Guard>;
}

/// A Loom immutable pointer borrowed from a guard instance.
pub struct GuardDeref<'a, T: ?Sized, G: Guard<'a, T>> {
    ptr: ConstPtr<T>,
    marker: PhantomData<(&'a T, G)>,
}

impl<'a, T: ?Sized, G: Guard<'a, T>> GuardDeref<'a, T, G> {
    pub(crate) fn new(ptr: ConstPtr<T>) -> Self {
        Self { ptr, marker: PhantomData }
    }
}

impl<'a, T: ?Sized, G: Guard<'a, T>> Deref for GuardDeref<'a, T, G> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: Our lifetime is bounded by the guard borrow.
        unsafe { self.ptr.deref() }
    }
}

/// A Loom mutable pointer borrowed from a guard instance.
pub struct GuardDerefMut<'a, T: ?Sized, G: Guard<'a, T>> {
    ptr: MutPtr<T>,
    marker: PhantomData<(&'a mut T, G)>,
}

impl<'a, T: ?Sized, G: Guard<'a, T>> GuardDerefMut<'a, T, G> {
    pub(crate) fn new(ptr: MutPtr<T>) -> Self {
        Self { ptr, marker: PhantomData }
    }
}

impl<'a, T: ?Sized, G: Guard<'a, T>> Deref for GuardDerefMut<'a, T, G> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: Our lifetime is bounded by the guard borrow.
        unsafe { self.ptr.deref() }
    }
}

impl<'a, T: ?Sized, G: Guard<'a, T>> DerefMut for GuardDerefMut<'a, T, G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: Our lifetime is bounded by the guard borrow.
        unsafe { self.ptr.deref() }
    }
}
