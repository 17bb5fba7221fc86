//! # Kernel synchronization primitives
//!
//! Short-section locks for the kernel core. Nothing in here ever blocks on
//! the scheduler: the blocking primitives (mutex, condition variable,
//! semaphore, reader-writer lock) are built on top of these in the `kernel`
//! crate, and the scheduler itself is protected by them.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod raw_spin;
mod raw_ticket;
mod sync_once_cell;

pub use irq::{InterruptControl, IrqGuard, IrqMutex, SimulatedInterrupts};
pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;
pub use sync_once_cell::SyncOnceCell;

/// Test-and-set spin lock.
pub type SpinLock<T> = Mutex<T, RawSpin>;
pub type SpinLockGuard<'a, T> = MutexGuard<'a, T, RawSpin>;

/// FIFO ticket lock.
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
    fn raw_is_locked(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// Only the holder of the lock may release it.
    unsafe fn raw_unlock(&self);
}
