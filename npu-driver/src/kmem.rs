//! Accounted kernel heap
//!
//! Transient descriptors built on the ioctl paths are allocated through
//! [`Kmem`] so that leaks show up in [`Kmem::live_allocations`].

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// Kernel allocation accounting
#[derive(Debug, Default)]
pub struct Kmem {
    live: AtomicUsize,
    live_bytes: AtomicUsize,
    /// Countdown to an injected failure, 0 when disarmed
    fail_in: AtomicUsize,
}

impl Kmem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocations not yet released
    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }

    /// Make the `nth` allocation from now fail (1 = the next one)
    pub fn fail_nth(&self, nth: usize) {
        self.fail_in.store(nth, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> bool {
        self.fail_in
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|previous| previous == 1)
            .unwrap_or(false)
    }

    fn account(&self, bytes: usize) -> Result<()> {
        if self.injected_failure() {
            return Err(Error::OutOfMemory);
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        self.live_bytes.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }

    /// Allocate one object
    pub fn alloc<T>(&self, value: T) -> Result<KBox<'_, T>> {
        let bytes = mem::size_of::<T>();
        self.account(bytes)?;
        Ok(KBox {
            value,
            bytes,
            kmem: self,
        })
    }

    /// Allocate a zeroed array of exactly `count` elements
    pub fn alloc_array<T: Default + Clone>(&self, count: usize) -> Result<KBox<'_, Vec<T>>> {
        let bytes = count
            .checked_mul(mem::size_of::<T>())
            .ok_or(Error::OutOfMemory)?;
        let mut array = Vec::new();
        array.try_reserve_exact(count)?;
        array.resize(count, T::default());
        self.account(bytes)?;
        Ok(KBox {
            value: array,
            bytes,
            kmem: self,
        })
    }
}

/// A value whose storage is accounted against a [`Kmem`]
pub struct KBox<'a, T> {
    value: T,
    bytes: usize,
    kmem: &'a Kmem,
}

impl<T> Deref for KBox<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for KBox<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for KBox<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl<T> Drop for KBox<'_, T> {
    fn drop(&mut self) {
        self.kmem.live.fetch_sub(1, Ordering::SeqCst);
        self.kmem.live_bytes.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}
