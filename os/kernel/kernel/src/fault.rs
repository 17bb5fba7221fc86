//! # Page-fault routing

use crate::Kernel;
use crate::config::KERNEL_PID;
use crate::error::halt;
use crate::process::FaultReport;
use kernel_sync::IrqGuard;
use kernel_vmem::{FaultCause, FaultResolution, PageFault, VmError};

/// What became of a page fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The faulting access can be retried.
    Resolved(FaultResolution),
    /// The access was illegal; the faulting process is dead and another
    /// thread is running.
    Killed(FaultReport),
}

impl Kernel {
    /// Page-fault entry for a fault raised by the current thread in user
    /// mode.
    ///
    /// Copy-on-write writes and first touches of lazy pages are resolved.
    /// Any other fault terminates the faulting process, and only that one.
    /// A fault in the kernel process halts.
    pub fn page_fault(&self, fault: PageFault) -> FaultOutcome {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        let tid = self.current_thread();
        let pid = self.current_process();
        if pid == KERNEL_PID {
            halt(format_args!(
                "kernel page fault at {} ({})",
                fault.address,
                fault.error.explain()
            ));
        }

        let result = self.processes.with(pid, |p| match p.space.as_mut() {
            Some(space) => self.with_vm(|ctx| space.handle_fault(ctx, fault)),
            None => Err(VmError::IllegalFault {
                address: fault.address,
                cause: FaultCause::Unmapped,
            }),
        });
        let cause = match result {
            Ok(Ok(resolution)) => {
                log::trace!("{tid} fault at {} resolved: {resolution:?}", fault.address);
                return FaultOutcome::Resolved(resolution);
            }
            Ok(Err(VmError::IllegalFault { cause, .. })) => cause,
            Ok(Err(e)) => {
                log::warn!("fault at {} unresolvable: {e}", fault.address);
                FaultCause::OutOfMemory
            }
            Err(_) => halt(format_args!("fault in {pid} without a control block")),
        };

        let report = FaultReport {
            tid,
            pid,
            address: fault.address,
            access: fault.access(),
            cause,
        };
        self.kill_process(report);
        self.reschedule();
        FaultOutcome::Killed(report)
    }
}
