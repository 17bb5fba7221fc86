//! # Process control blocks

use crate::store::StoreId;
use crate::thread::ThreadId;
use crate::wait_queue::WaitQueue;
use alloc::collections::{BTreeSet, VecDeque};
use alloc::vec::Vec;
use kernel_vmem::{Access, AddressSpace, FaultCause, VirtualAddress};

#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl StoreId for ProcessId {
    fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

impl core::fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcessState {
    Alive,
    /// All threads exited; waiting for the parent to reap.
    Zombie,
}

/// Why a process was killed by the kernel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FaultReport {
    pub tid: ThreadId,
    pub pid: ProcessId,
    pub address: VirtualAddress,
    pub access: Access,
    pub cause: FaultCause,
}

impl core::fmt::Display for FaultReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}/{}: {:?} at {}: {}",
            self.pid, self.tid, self.access, self.address, self.cause
        )
    }
}

/// A process: one address space and the threads sharing it.
///
/// The PCB lock also serves as the process's VM lock; the address space is
/// only touched while it is held.
pub struct Pcb {
    pub pid: ProcessId,
    pub parent: Option<ProcessId>,
    pub state: ProcessState,
    /// `None` for the kernel process and after teardown.
    pub space: Option<AddressSpace>,
    /// Live threads. Non-empty while the process is alive.
    pub threads: BTreeSet<ThreadId>,
    /// Exited threads of a dying process. Their control blocks go on reap.
    pub dead_threads: Vec<ThreadId>,
    /// Children not yet reaped, alive or zombie.
    pub children: BTreeSet<ProcessId>,
    /// Exited children in exit order.
    pub zombies: VecDeque<ProcessId>,
    /// Threads of this process blocked in `wait`.
    pub reap_waiters: WaitQueue,
    pub exit_status: Option<i32>,
    pub fault: Option<FaultReport>,
}

impl Pcb {
    #[must_use]
    pub fn new(pid: ProcessId, parent: Option<ProcessId>, space: Option<AddressSpace>) -> Self {
        Self {
            pid,
            parent,
            state: ProcessState::Alive,
            space,
            threads: BTreeSet::new(),
            dead_threads: Vec::new(),
            children: BTreeSet::new(),
            zombies: VecDeque::new(),
            reap_waiters: WaitQueue::new(),
            exit_status: None,
            fault: None,
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state == ProcessState::Alive
    }
}

impl core::fmt::Debug for Pcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pcb")
            .field("pid", &self.pid)
            .field("parent", &self.parent)
            .field("state", &self.state)
            .field("threads", &self.threads)
            .field("children", &self.children)
            .field("exit_status", &self.exit_status)
            .finish_non_exhaustive()
    }
}
