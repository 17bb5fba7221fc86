//! Interrupt-disable guards.
//!
//! The core runs on a single logical processor, so "mutual exclusion against
//! everything else" means "interrupt delivery is off". [`IrqGuard`] snapshots
//! the interrupt flag of an [`InterruptControl`], disables delivery, and
//! restores the previous state on drop. Guards nest.
//!
//! The flag itself is pluggable: bare-metal x86-64 builds get
//! [`X86Interrupts`] (`cli`/`sti`/`pushfq`), host builds and tests use
//! [`SimulatedInterrupts`].

use crate::{Mutex, MutexGuard, RawLock, RawUnlock};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Access to the processor's interrupt-enable flag.
pub trait InterruptControl: Send + Sync {
    /// Whether interrupt delivery is currently enabled.
    fn enabled(&self) -> bool;

    /// Disable interrupt delivery.
    fn disable(&self);

    /// Enable interrupt delivery.
    fn enable(&self);
}

/// Interrupt flag of a simulated processor.
///
/// Starts out enabled, like a CPU that has finished boot. Counts how often
/// delivery was switched off, which tests use to check that kernel entry
/// points really run with interrupts disabled.
#[derive(Debug)]
pub struct SimulatedInterrupts {
    enabled: AtomicBool,
    disables: AtomicUsize,
}

impl Default for SimulatedInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInterrupts {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            disables: AtomicUsize::new(0),
        }
    }

    /// Number of enabled → disabled transitions so far.
    pub fn disable_count(&self) -> usize {
        self.disables.load(Ordering::Relaxed)
    }
}

impl InterruptControl for SimulatedInterrupts {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn disable(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            self.disables.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }
}

/// The interrupt flag of the executing x86-64 processor (`RFLAGS.IF`).
///
/// # Safety & Privilege
///
/// Must only be used where `cli`/`sti` are legal (ring 0).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Interrupts;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl InterruptControl for X86Interrupts {
    #[inline]
    fn enabled(&self) -> bool {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        (r & (1 << 9)) != 0
    }

    #[inline]
    fn disable(&self) {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    fn enable(&self) {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Delivery is re-enabled on drop **only** if it was enabled when the guard
/// was created, so nested guards compose.
pub struct IrqGuard<'a> {
    ctl: &'a dyn InterruptControl,
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl<'a> IrqGuard<'a> {
    #[inline]
    #[must_use]
    pub fn new(ctl: &'a dyn InterruptControl) -> Self {
        let were_enabled = ctl.enabled();
        if were_enabled {
            ctl.disable();
        }
        Self { ctl, were_enabled }
    }

    /// Whether this guard will re-enable delivery when dropped.
    #[inline]
    #[must_use]
    pub const fn restores(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        if self.were_enabled {
            self.ctl.enable();
        }
    }
}

/// A mutex guard that also keeps interrupts disabled while held.
///
/// Field order matters: the mutex is released before interrupts come back.
pub struct IrqMutex<'a, T, R: RawLock + RawUnlock> {
    guard: MutexGuard<'a, T, R>,
    _irq: IrqGuard<'a>,
}

impl<T, R: RawLock + RawUnlock> core::ops::Deref for IrqMutex<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, R: RawLock + RawUnlock> core::ops::DerefMut for IrqMutex<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Acquires the mutex with interrupts disabled for the guard's lifetime.
    ///
    /// Interrupts are disabled *before* spinning so that a handler can never
    /// interrupt the holder and spin on the same lock.
    #[inline]
    pub fn lock_irq<'a>(&'a self, ctl: &'a dyn InterruptControl) -> IrqMutex<'a, T, R> {
        let irq = IrqGuard::new(ctl);
        let guard = self.lock();
        IrqMutex { guard, _irq: irq }
    }
}
