//! # Thread control blocks

use crate::config::Priority;
use crate::cpu::Context;
use crate::error::KernelError;
use crate::process::ProcessId;
use crate::store::StoreId;
use crate::sync::Continuation;
use alloc::boxed::Box;
use alloc::vec;

#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl StoreId for ThreadId {
    fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl core::fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(self, f)
    }
}

/// Run state of a thread.
///
/// ```text
/// Runnable ──► Running ──► Runnable (preempted / yielded)
///                 │──────► Blocked ──► Runnable (woken)
///                 └──────► Exited
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadState {
    Runnable,
    Running,
    Blocked,
    Exited,
}

/// Result delivered to a thread whose blocking call completed while it was
/// switched out: the two return registers, or the error.
pub type Completion = Result<(u64, u64), KernelError>;

/// Kernel stack backing of one thread.
pub struct KernelStack {
    bytes: Box<[u8]>,
}

impl KernelStack {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size].into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Highest address, 16 byte aligned; stacks grow down from here.
    #[must_use]
    pub fn top(&self) -> usize {
        (self.bytes.as_ptr() as usize + self.bytes.len()) & !0xF
    }
}

pub struct Tcb {
    pub tid: ThreadId,
    pub pid: ProcessId,
    pub state: ThreadState,
    pub priority: Priority,
    pub context: Context,
    pub kernel_stack: KernelStack,
    /// Timer ticks consumed in the current slice.
    pub slice_used: u32,
    /// Kernel-side remainder of the blocking call this thread is parked in.
    pub continuation: Option<Continuation>,
    /// Result of that call once it completed.
    pub completion: Option<Completion>,
    pub exit_status: Option<i32>,
}

impl Tcb {
    #[must_use]
    pub fn new(
        tid: ThreadId,
        pid: ProcessId,
        context: Context,
        priority: Priority,
        stack_size: usize,
    ) -> Self {
        Self {
            tid,
            pid,
            state: ThreadState::Runnable,
            priority,
            context,
            kernel_stack: KernelStack::new(stack_size),
            slice_used: 0,
            continuation: None,
            completion: None,
            exit_status: None,
        }
    }
}

impl core::fmt::Debug for Tcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tcb")
            .field("tid", &self.tid)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("rip", &format_args!("{:#x}", self.context.rip))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_threads_are_runnable() {
        let tcb = Tcb::new(ThreadId::new(3), ProcessId::new(1), Context::default(), 8, 4096);
        assert_eq!(tcb.state, ThreadState::Runnable);
        assert_eq!(tcb.kernel_stack.len(), 4096);
        assert_eq!(tcb.kernel_stack.top() % 16, 0);
        assert_eq!(format!("{}", tcb.tid), "t3");
    }
}
