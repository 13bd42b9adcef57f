use std::{fmt, ops::Deref, ops::DerefMut, ptr::NonNull};

use super::trace::Traced;

/// A raw handle to an object owned by the garbage collector.
///
/// The pointee is only deallocated by the sweep phase, and sweeping never
/// frees an object that is still reachable from the collector's roots. A
/// `Gc` obtained from a live root therefore always points at a valid
/// `Traced<T>`.
pub struct Gc<T> {
    ptr: NonNull<Traced<T>>,
}

impl<T> Gc<T> {
    /// Creates a new handle, called by the collector when tracking an object.
    pub(super) fn new(ptr: &mut Traced<T>) -> Self {
        Self {
            ptr: NonNull::from(ptr),
        }
    }

    /// Returns a reference to the inner type `T`.
    pub fn as_ref(&self) -> &T {
        unsafe { &self.ptr.as_ref().data }
    }

    /// Returns a mutable reference to the inner type `T`.
    pub fn as_mut(&mut self) -> &mut T {
        unsafe { &mut self.ptr.as_mut().data }
    }

    /// Returns whether the two handles refer to the same object.
    pub fn ptr_eq(a: &Gc<T>, b: &Gc<T>) -> bool {
        a.ptr == b.ptr
    }

    /// Returns whether this object has been marked as reachable.
    pub(super) fn marked(&self) -> bool {
        unsafe { self.ptr.as_ref().marked() }
    }

    /// Marks this object as reachable.
    pub(super) fn mark(&self) {
        unsafe { self.ptr.as_ref().set_mark(true) }
    }
}

impl<T> Copy for Gc<T> {}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

impl<T> DerefMut for Gc<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut()
    }
}

impl<T: fmt::Debug> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc {{ ptr: {:?} }}", self.ptr.as_ptr())
    }
}
