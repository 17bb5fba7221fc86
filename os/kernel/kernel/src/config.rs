//! # Kernel configuration

use crate::process::ProcessId;
use crate::thread::ThreadId;

/// Process id of the kernel's own process, which owns the idle thread.
pub const KERNEL_PID: ProcessId = ProcessId::new(0);

/// Thread id of the idle thread.
pub const IDLE_TID: ThreadId = ThreadId::new(0);

/// Process id assigned to the first spawned process.
pub const INIT_PID: ProcessId = ProcessId::new(1);

/// Size of a saved register context in bytes.
pub const CONTEXT_SIZE: usize = core::mem::size_of::<crate::cpu::Context>();

/// Scheduling policy.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum SchedPolicy {
    /// FIFO run queue, every thread gets the same time slice.
    #[default]
    RoundRobin,
    /// Highest priority runnable thread first; round-robin among equals.
    /// A runnable thread of higher priority preempts the current one on
    /// the next timer tick.
    Priority,
}

/// Thread priority. Higher values run first under [`SchedPolicy::Priority`].
pub type Priority = u8;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelConfig {
    /// Timer ticks a thread may run before it is preempted.
    pub time_slice_ticks: u32,
    pub policy: SchedPolicy,
    /// Priority of threads created without an explicit one.
    pub default_priority: Priority,
    /// Control block capacity; exhaustion reports `OutOfMemory`.
    pub max_threads: usize,
    pub max_processes: usize,
    /// Synchronization objects reachable through system calls.
    pub max_sync_objects: usize,
    /// Bytes reserved per thread for its kernel stack.
    pub kernel_stack_size: usize,
    /// Readers admitted to a reader-writer lock while a writer is waiting.
    pub rwlock_reader_batch: usize,
    /// Exit status recorded for a process killed by an illegal fault.
    pub fault_exit_status: i32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            time_slice_ticks: 4,
            policy: SchedPolicy::RoundRobin,
            default_priority: 8,
            max_threads: 1024,
            max_processes: 256,
            max_sync_objects: 1024,
            kernel_stack_size: 16 * 1024,
            rwlock_reader_batch: 4,
            fault_exit_status: -2,
        }
    }
}

impl KernelConfig {
    #[must_use]
    pub const fn with_policy(mut self, policy: SchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub const fn with_time_slice(mut self, ticks: u32) -> Self {
        self.time_slice_ticks = ticks;
        self
    }

    #[must_use]
    pub const fn with_limits(mut self, max_threads: usize, max_processes: usize) -> Self {
        self.max_threads = max_threads;
        self.max_processes = max_processes;
        self
    }

    #[must_use]
    pub const fn with_reader_batch(mut self, batch: usize) -> Self {
        self.rwlock_reader_batch = batch;
        self
    }
}
