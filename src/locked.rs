//! A spin lock around an allocator, for sharing one bank between threads.
//!
//! The allocators themselves do no locking. Callers that hand a bank to
//! several threads wrap it here and hold the guard for the length of each
//! operation (or a whole sequence of them).

use spin::{Mutex, MutexGuard};

use crate::algorithm::Algorithm;

/// A thread-safe allocator, using a spin lock around an [`Algorithm`].
#[derive(Debug)]
pub struct Locked<A> {
    inner: Mutex<A>,
}

impl<A: Algorithm> Locked<A> {
    pub fn new(allocator: A) -> Self {
        Locked {
            inner: Mutex::new(allocator),
        }
    }

    /// Block until the allocator is free, then borrow it.
    ///
    /// Other threads spin while the guard is held, so keep it short.
    pub fn lock(&self) -> MutexGuard<'_, A> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, A>> {
        self.inner.try_lock()
    }

    pub fn into_inner(self) -> A {
        self.inner.into_inner()
    }
}
