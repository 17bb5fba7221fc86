//! # Processor abstraction
//!
//! The scheduler and the context switch engine talk to the processor only
//! through [`Cpu`]. [`SimulatedCpu`] implements it on the host: a register
//! file, the active page-table root and an interrupt flag.

use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::{InterruptControl, SimulatedInterrupts, SpinLock};
use kernel_vmem::{Frame, VirtualAddress, VirtualPage};

/// User code segment selector (GDT index 4, RPL 3).
pub const USER_CS: u64 = 0x23;

/// User stack segment selector (GDT index 3, RPL 3).
pub const USER_SS: u64 = 0x1B;

/// The RFLAGS register.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Rflags {
    pub carry: bool, // bit 0

    /// Always reads as 1.
    #[bits(1, default = true)]
    pub reserved_one: bool, // bit 1

    #[bits(7)]
    __low: u8, // bits 2-8

    pub interrupt_enable: bool, // bit 9

    #[bits(54)]
    __high: u64,
}

/// Saved execution state of one thread.
///
/// Laid out like the trap frame built on kernel entry: the hardware-pushed
/// part first, then the general purpose registers in push order. The
/// context switch engine is the only writer of a thread's saved copy.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Context {
    pub rip: u64,
    pub cs: u64,
    pub rflags: Rflags,
    pub rsp: u64,
    pub ss: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl Context {
    /// Entry state of a new user thread: interrupts enabled, `arg` in the
    /// first argument register.
    #[must_use]
    pub fn user(entry: VirtualAddress, stack_top: VirtualAddress, arg: u64) -> Self {
        Self {
            rip: entry.as_u64(),
            cs: USER_CS,
            rflags: Rflags::new().with_interrupt_enable(true),
            rsp: stack_top.as_u64(),
            ss: USER_SS,
            rdi: arg,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn instruction_pointer(&self) -> VirtualAddress {
        VirtualAddress::new(self.rip)
    }

    #[must_use]
    pub const fn stack_pointer(&self) -> VirtualAddress {
        VirtualAddress::new(self.rsp)
    }

    /// System call number, passed in `rax`.
    #[must_use]
    pub const fn syscall_number(&self) -> u64 {
        self.rax
    }

    /// System call arguments in `rdi, rsi, rdx, r10, r8, r9` order.
    #[must_use]
    pub const fn syscall_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }

    /// Sets the two return registers (`rax`, `rdx`).
    pub const fn set_return(&mut self, primary: u64, secondary: u64) {
        self.rax = primary;
        self.rdx = secondary;
    }

    #[must_use]
    pub const fn return_values(&self) -> (u64, u64) {
        (self.rax, self.rdx)
    }
}

/// The processor as seen by the scheduler.
pub trait Cpu: Send + Sync {
    /// Copies the live registers into `ctx`.
    fn save(&self, ctx: &mut Context);

    /// Loads `ctx` into the live registers.
    fn restore(&self, ctx: &Context);

    /// Loads a page-table root; `None` selects the kernel-only tables.
    fn activate(&self, root: Option<Frame>);

    fn active_root(&self) -> Option<Frame>;

    /// Drops any cached translation of `page` in the active address space.
    fn invalidate(&self, page: VirtualPage);

    fn interrupts(&self) -> &dyn InterruptControl;
}

/// Host-side processor model used by tests and tooling.
pub struct SimulatedCpu {
    registers: SpinLock<Context>,
    root: SpinLock<Option<Frame>>,
    interrupts: SimulatedInterrupts,
    invalidations: AtomicU64,
    activations: AtomicU64,
}

impl SimulatedCpu {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            registers: SpinLock::new(Context {
                rip: 0,
                cs: 0,
                rflags: Rflags::new(),
                rsp: 0,
                ss: 0,
                rax: 0,
                rbx: 0,
                rcx: 0,
                rdx: 0,
                rsi: 0,
                rdi: 0,
                rbp: 0,
                r8: 0,
                r9: 0,
                r10: 0,
                r11: 0,
                r12: 0,
                r13: 0,
                r14: 0,
                r15: 0,
            }),
            root: SpinLock::new(None),
            interrupts: SimulatedInterrupts::new(),
            invalidations: AtomicU64::new(0),
            activations: AtomicU64::new(0),
        }
    }

    /// Snapshot of the live registers.
    #[must_use]
    pub fn registers(&self) -> Context {
        *self.registers.lock()
    }

    /// Lets "user code" modify the live registers, e.g. to stage a system call.
    pub fn with_registers<R>(&self, f: impl FnOnce(&mut Context) -> R) -> R {
        f(&mut *self.registers.lock())
    }

    /// Number of single-page TLB invalidations issued.
    #[must_use]
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Number of page-table root loads.
    #[must_use]
    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    /// How often kernel entry switched interrupt delivery off.
    #[must_use]
    pub fn interrupt_disables(&self) -> usize {
        self.interrupts.disable_count()
    }
}

impl Default for SimulatedCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu for SimulatedCpu {
    fn save(&self, ctx: &mut Context) {
        *ctx = *self.registers.lock();
    }

    fn restore(&self, ctx: &Context) {
        *self.registers.lock() = *ctx;
    }

    fn activate(&self, root: Option<Frame>) {
        *self.root.lock() = root;
        self.activations.fetch_add(1, Ordering::Relaxed);
    }

    fn active_root(&self) -> Option<Frame> {
        *self.root.lock()
    }

    fn invalidate(&self, _page: VirtualPage) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn interrupts(&self) -> &dyn InterruptControl {
        &self.interrupts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rflags_reserved_bit_is_set() {
        assert_eq!(Rflags::new().into_bits(), 0b10);
        assert_eq!(Rflags::new().with_interrupt_enable(true).into_bits(), 0x202);
    }

    #[test]
    fn user_context() {
        let ctx = Context::user(VirtualAddress::new(0x40_0000), VirtualAddress::new(0x7000), 5);
        assert_eq!(ctx.instruction_pointer().as_u64(), 0x40_0000);
        assert_eq!(ctx.stack_pointer().as_u64(), 0x7000);
        assert_eq!(ctx.syscall_args()[0], 5);
        assert_eq!(ctx.cs & 3, 3);
    }

    #[test]
    fn save_restore() {
        let cpu = SimulatedCpu::new();
        let mut ctx = Context::default();
        ctx.set_return(1, 2);
        cpu.restore(&ctx);
        let mut out = Context::default();
        cpu.save(&mut out);
        assert_eq!(out.return_values(), (1, 2));
    }

    #[test]
    fn context_is_twenty_registers() {
        assert_eq!(crate::config::CONTEXT_SIZE, 20 * 8);
    }
}
