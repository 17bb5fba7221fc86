use crate::addresses::VirtualAddress;
use bitfield_struct::bitfield;

/// Kind of memory access that caused a fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

/// Page-fault error code layout (x86-64).
///
/// Produced by [`AddressSpace::access`](super::AddressSpace::access) exactly
/// like the MMU pushes it for vector 14.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    #[bits(59)]
    __: u64,
}

impl PageFaultError {
    #[must_use]
    pub const fn for_access(access: Access, present: bool) -> Self {
        Self::new()
            .with_present(present)
            .with_user(true)
            .with_write(matches!(access, Access::Write))
            .with_instruction_fetch(matches!(access, Access::Execute))
    }

    #[must_use]
    pub const fn access(&self) -> Access {
        if self.instruction_fetch() {
            Access::Execute
        } else if self.write() {
            Access::Write
        } else {
            Access::Read
        }
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (not mapped or not yet populated)"
        } else if self.instruction_fetch() {
            "Instruction fetch on non-executable page"
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// A page fault as delivered to the kernel: faulting address plus error code.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub error: PageFaultError,
}

impl PageFault {
    #[must_use]
    pub const fn new(address: VirtualAddress, access: Access, present: bool) -> Self {
        Self {
            address,
            error: PageFaultError::for_access(access, present),
        }
    }

    #[must_use]
    pub const fn access(&self) -> Access {
        self.error.access()
    }
}

/// Why a fault could not be resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FaultCause {
    #[error("no region covers the address")]
    Unmapped,
    #[error("write to a read-only region")]
    WriteProtected,
    #[error("read from a non-readable region")]
    NotReadable,
    #[error("instruction fetch from a non-executable region")]
    NotExecutable,
    #[error("no frame available to back the page")]
    OutOfMemory,
}

/// How a legitimate fault was resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultResolution {
    /// A shared copy-on-write page was duplicated into a private frame.
    CopiedOnWrite,
    /// The faulting process held the last reference to a copy-on-write
    /// frame, which was made writable in place.
    Reclaimed,
    /// A lazy region page was populated with a zeroed frame.
    ZeroFilled,
    /// The translation already permits the access.
    Spurious,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_bits() {
        let w = PageFaultError::for_access(Access::Write, true);
        assert_eq!(w.into_bits(), 0b0111);
        let x = PageFaultError::for_access(Access::Execute, false);
        assert_eq!(x.into_bits(), 0b1_0100);
        assert_eq!(x.access(), Access::Execute);
        assert_eq!(
            PageFaultError::for_access(Access::Read, false).explain(),
            "Non-present page (not mapped or not yet populated)"
        );
    }
}
