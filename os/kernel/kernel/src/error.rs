//! # Kernel errors and the halt path

use kernel_vmem::{FrameError, VmError};

/// Errors returned by kernel operations to their immediate caller.
///
/// The system-call layer surfaces these to user code as negative return
/// values, see [`KernelError::code`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("range overlaps an existing mapping")]
    Overlap,
    #[error("caller does not own the lock")]
    NotOwner,
    #[error("no such entity")]
    NoSuchEntity,
    #[error("frame freed twice")]
    DoubleFree,
    #[error("illegal memory access")]
    IllegalFault,
    #[error("caller already holds the lock")]
    Deadlock,
    #[error("invalid argument")]
    InvalidArgument,
}

impl KernelError {
    /// Negative error number as placed into the return register.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::OutOfMemory => -1,
            Self::Overlap => -2,
            Self::NotOwner => -3,
            Self::NoSuchEntity => -4,
            Self::DoubleFree => -5,
            Self::IllegalFault => -6,
            Self::Deadlock => -7,
            Self::InvalidArgument => -8,
        }
    }

    /// Inverse of [`Self::code`].
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            -1 => Self::OutOfMemory,
            -2 => Self::Overlap,
            -3 => Self::NotOwner,
            -4 => Self::NoSuchEntity,
            -5 => Self::DoubleFree,
            -6 => Self::IllegalFault,
            -7 => Self::Deadlock,
            -8 => Self::InvalidArgument,
            _ => return None,
        })
    }
}

impl From<FrameError> for KernelError {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::OutOfMemory => Self::OutOfMemory,
            FrameError::DoubleFree(_) => Self::DoubleFree,
            FrameError::NotManaged(_) => Self::InvalidArgument,
        }
    }
}

impl From<VmError> for KernelError {
    fn from(value: VmError) -> Self {
        match value {
            VmError::OutOfMemory => Self::OutOfMemory,
            VmError::Overlap => Self::Overlap,
            VmError::NotMapped(_) => Self::NoSuchEntity,
            VmError::Unaligned | VmError::InvalidRange => Self::InvalidArgument,
            VmError::IllegalFault { .. } => Self::IllegalFault,
            VmError::Frame(e) => e.into(),
        }
    }
}

/// Stops the kernel after an unrecoverable invariant violation.
///
/// There is no state worth preserving at this point; the message goes to the
/// log sink and the current execution unwinds.
#[cold]
#[track_caller]
pub fn halt(reason: core::fmt::Arguments<'_>) -> ! {
    log::error!("kernel halted: {reason}");
    panic!("kernel halted: {reason}");
}
