//! # User memory access
//!
//! Loads and stores performed by the kernel on behalf of the current
//! thread go through the page tables with user-mode permission checks, so
//! they fault exactly where the thread itself would.

use crate::Kernel;
use crate::error::{KernelError, halt};
use crate::fault::FaultOutcome;
use crate::process::FaultReport;
use kernel_vmem::info::PAGE_SIZE;
use kernel_vmem::{Access, PageFault, PhysicalAddress, VirtualAddress};

/// Faults tolerated on one page before the access is considered stuck.
const MAX_FAULTS_PER_PAGE: usize = 3;

impl Kernel {
    /// Copies `buf.len()` bytes from the current process at `va`.
    ///
    /// An illegal access kills the process; the report is returned and the
    /// caller must not touch the thread any further.
    pub fn user_read(&self, va: VirtualAddress, buf: &mut [u8]) -> Result<(), FaultReport> {
        let mut done = 0usize;
        while done < buf.len() {
            let at = va + done as u64;
            let n = chunk_len(at, buf.len() - done);
            let pa = self.user_access(at, Access::Read)?;
            self.memory
                .read(pa.frame(), pa_offset(pa), &mut buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Copies `bytes` into the current process at `va`, breaking
    /// copy-on-write sharing and backing lazy pages as needed.
    pub fn user_write(&self, va: VirtualAddress, bytes: &[u8]) -> Result<(), FaultReport> {
        let mut done = 0usize;
        while done < bytes.len() {
            let at = va + done as u64;
            let n = chunk_len(at, bytes.len() - done);
            let pa = self.user_access(at, Access::Write)?;
            self.memory
                .write(pa.frame(), pa_offset(pa), &bytes[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Checks that `[va, va + len)` lies in regions of the current process
    /// that permit `access`.
    pub fn validate_user_range(
        &self,
        va: VirtualAddress,
        len: u64,
        access: Access,
    ) -> Result<(), KernelError> {
        let pid = self.current_process();
        let valid = self.processes.with(pid, |p| {
            p.space
                .as_ref()
                .is_some_and(|space| space.validate_range(va, len, access))
        })?;
        if valid {
            Ok(())
        } else {
            Err(KernelError::InvalidArgument)
        }
    }

    /// Translates one user access, resolving faults on the way.
    fn user_access(&self, va: VirtualAddress, access: Access) -> Result<PhysicalAddress, FaultReport> {
        let pid = self.current_process();
        for _ in 0..=MAX_FAULTS_PER_PAGE {
            let attempt = self
                .processes
                .with(pid, |p| match p.space.as_ref() {
                    Some(space) => self.with_vm(|ctx| space.access(ctx, va, access)),
                    None => Err(PageFault::new(va, access, false)),
                })
                .unwrap_or_else(|_| Err(PageFault::new(va, access, false)));
            let fault = match attempt {
                Ok(pa) => return Ok(pa),
                Err(fault) => fault,
            };
            match self.page_fault(fault) {
                FaultOutcome::Resolved(_) => {}
                FaultOutcome::Killed(report) => return Err(report),
            }
        }
        halt(format_args!("{access:?} access at {va} keeps faulting"))
    }
}

/// Bytes from `va` to the end of its page, capped at `remaining`.
#[allow(clippy::cast_possible_truncation)]
const fn chunk_len(va: VirtualAddress, remaining: usize) -> usize {
    let in_page = (PAGE_SIZE - va.page_offset()) as usize;
    if in_page < remaining { in_page } else { remaining }
}

#[allow(clippy::cast_possible_truncation)]
const fn pa_offset(pa: PhysicalAddress) -> usize {
    pa.page_offset() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_stop_at_page_boundaries() {
        assert_eq!(chunk_len(VirtualAddress::new(0x40_0000), 10), 10);
        assert_eq!(chunk_len(VirtualAddress::new(0x40_0FFE), 10), 2);
        assert_eq!(chunk_len(VirtualAddress::new(0x40_0000), 9000), 4096);
    }
}
