//! Interrupt-safe state cells shared between the tick/edge handlers and the poller.
//!
//! Every access goes through a `critical_section`, which on the target masks
//! interrupts for the duration of the read or write. Values are `Copy`
//! snapshots: a reader never observes a half-written record.

use core::cell::Cell;
use critical_section::{CriticalSection, Mutex};

/// A `Copy` value guarded by a critical section.
pub struct Shared<T> {
    inner: Mutex<Cell<T>>,
}

impl<T: Copy> Shared<T> {
    pub const fn new(value: T) -> Self {
        Shared {
            inner: Mutex::new(Cell::new(value)),
        }
    }

    /// Snapshot the value in its own critical section.
    pub fn load(&self) -> T {
        critical_section::with(|cs| self.get(cs))
    }

    /// Overwrite the value in its own critical section.
    pub fn store(&self, value: T) {
        critical_section::with(|cs| self.set(cs, value))
    }

    /// Read inside a critical section the caller already holds.
    pub fn get(&self, cs: CriticalSection<'_>) -> T {
        self.inner.borrow(cs).get()
    }

    /// Write inside a critical section the caller already holds.
    pub fn set(&self, cs: CriticalSection<'_>, value: T) {
        self.inner.borrow(cs).set(value)
    }

    /// Write and return the previous value inside a held critical section.
    pub fn replace(&self, cs: CriticalSection<'_>, value: T) -> T {
        self.inner.borrow(cs).replace(value)
    }
}

impl<T: Copy> Shared<Option<T>> {
    /// Read and clear in one critical section.
    pub fn take(&self) -> Option<T> {
        critical_section::with(|cs| self.inner.borrow(cs).take())
    }
}
