//! # Kernel core
//!
//! Threads, processes, scheduling and blocking synchronization for a single
//! processor. The surrounding kernel (trap handlers, timer, loader) drives the
//! core through the entry points on [`Kernel`]:
//!
//! | Event                    | Entry point |
//! |--------------------------|-------------|
//! | boot                     | [`Kernel::new`], [`Kernel::boot`] |
//! | timer interrupt          | [`Kernel::timer_tick`] |
//! | page fault               | [`Kernel::page_fault`] |
//! | system call              | [`Kernel::syscall`] or the typed operations |
//!
//! Every entry point runs with interrupts disabled for its whole duration and
//! acts on behalf of the current thread. An operation that has to wait parks
//! the caller, switches to another thread and returns [`Poll::Pending`]; the
//! result is delivered into the caller's return registers once it is
//! resumed (see [`Kernel::take_completion`]).
//!
//! ## Lock order
//!
//! ```text
//! sync object ─► PCB (VM) ─► scheduler ─► TCB
//!                   └──────► frame pool
//! ```
//!
//! No short-section lock is held across a context switch.
//!
//! [`Poll::Pending`]: core::task::Poll::Pending

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod config;
pub mod cpu;
pub mod error;
mod fault;
pub mod lifecycle;
pub mod process;
mod sched;
pub mod store;
mod switch;
pub mod sync;
pub mod syscall;
pub mod thread;
mod uaccess;
pub mod wait_queue;

pub use crate::config::{KernelConfig, Priority, SchedPolicy};
pub use crate::cpu::{Context, Cpu, SimulatedCpu};
pub use crate::error::{KernelError, halt};
pub use crate::fault::FaultOutcome;
pub use crate::lifecycle::{LoadedImage, Segment, StackSpec};
pub use crate::process::{FaultReport, ProcessId, ProcessState};
pub use crate::sync::{Condvar, Mutex, RwLock, Semaphore};
pub use crate::syscall::{ObjectId, Sysno};
pub use crate::thread::{Completion, ThreadId, ThreadState};

use crate::config::{IDLE_TID, KERNEL_PID};
use crate::process::Pcb;
use crate::sched::Scheduler;
use crate::store::ControlBlockStore;
use crate::syscall::SyncObject;
use crate::thread::Tcb;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_sync::{SpinLock, SyncOnceCell};
use kernel_vmem::{
    AddressSpace, Frame, FrameAllocator, FramePool, MemoryRegion, PhysicalMemory, Translation,
    TlbInvalidate, VirtualAddress, VirtualPage, VmContext,
};

pub struct Kernel {
    config: KernelConfig,
    cpu: Arc<dyn Cpu>,
    memory: Arc<dyn PhysicalMemory>,
    frames: FramePool,
    threads: ControlBlockStore<ThreadId, Tcb>,
    processes: ControlBlockStore<ProcessId, Pcb>,
    objects: ControlBlockStore<ObjectId, SyncObject>,
    sched: SpinLock<Scheduler>,
    init: SyncOnceCell<ProcessId>,
}

/// Routes TLB shootdowns to the processor when the affected address space
/// is the active one.
struct CpuTlb<'a>(&'a dyn Cpu);

impl TlbInvalidate for CpuTlb<'_> {
    fn invalidate(&self, root: Frame, page: VirtualPage) {
        if self.0.active_root() == Some(root) {
            self.0.invalidate(page);
        }
    }
}

impl Kernel {
    /// Initializes the frame pool from `memory_map` and creates the kernel
    /// process with its idle thread, which becomes the running thread.
    pub fn new(
        config: KernelConfig,
        cpu: Arc<dyn Cpu>,
        memory: Arc<dyn PhysicalMemory>,
        memory_map: &[MemoryRegion],
    ) -> Result<Self, KernelError> {
        let frames = FramePool::new(FrameAllocator::new(memory_map));
        let threads = ControlBlockStore::new(config.max_threads);
        let processes = ControlBlockStore::new(config.max_processes);

        let (kernel_pid, kernel_pcb) = processes.insert_with(|pid| Pcb::new(pid, None, None))?;
        let (idle, _) = threads.insert_with(|tid| {
            let mut tcb = Tcb::new(
                tid,
                kernel_pid,
                Context::default(),
                0,
                config.kernel_stack_size,
            );
            tcb.state = ThreadState::Running;
            tcb
        })?;
        kernel_pcb.lock().threads.insert(idle);
        debug_assert_eq!((kernel_pid, idle), (KERNEL_PID, IDLE_TID));

        cpu.activate(None);
        log::info!(
            "kernel core up: {} frames, {:?} scheduling, {} tick slices",
            frames.lock().total_frames(),
            config.policy,
            config.time_slice_ticks
        );

        Ok(Self {
            objects: ControlBlockStore::new(config.max_sync_objects),
            sched: SpinLock::new(Scheduler::new(idle, config.policy)),
            config,
            cpu,
            memory,
            frames,
            threads,
            processes,
            init: SyncOnceCell::new(),
        })
    }

    /// Spawns the first process from `image` and switches to it.
    pub fn boot(&self, image: &LoadedImage<'_>) -> Result<ProcessId, KernelError> {
        if self.init.get().is_some() {
            return Err(KernelError::InvalidArgument);
        }
        let (pid, _) = self.spawn_process(image)?;
        self.yield_to(None)?;
        Ok(pid)
    }

    #[must_use]
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The first spawned process, ancestor of every orphan.
    #[must_use]
    pub fn init_pid(&self) -> Option<ProcessId> {
        self.init.get().copied()
    }

    pub(crate) fn with_vm<R>(&self, f: impl FnOnce(VmContext<'_>) -> R) -> R {
        let tlb = CpuTlb(&*self.cpu);
        f(VmContext::new(&*self.memory, &self.frames, &tlb))
    }

    pub(crate) fn pid_of(&self, tid: ThreadId) -> Result<ProcessId, KernelError> {
        self.threads.with(tid, |t| t.pid)
    }

    /// Process of the running thread.
    #[must_use]
    pub fn current_process(&self) -> ProcessId {
        let tid = self.current_thread();
        self.pid_of(tid)
            .unwrap_or_else(|_| halt(format_args!("running thread {tid} has no control block")))
    }

    pub fn thread_state(&self, tid: ThreadId) -> Result<ThreadState, KernelError> {
        self.threads.with(tid, |t| t.state)
    }

    pub fn process_of(&self, tid: ThreadId) -> Result<ProcessId, KernelError> {
        self.pid_of(tid)
    }

    /// Takes the result of a blocking call that completed while `tid` was
    /// switched out.
    pub fn take_completion(&self, tid: ThreadId) -> Option<Completion> {
        self.threads
            .with(tid, |t| t.completion.take())
            .ok()
            .flatten()
    }

    /// Saved registers of a thread that is not running.
    pub fn saved_context(&self, tid: ThreadId) -> Result<Context, KernelError> {
        self.threads.with(tid, |t| t.context)
    }

    pub fn process_state(&self, pid: ProcessId) -> Result<ProcessState, KernelError> {
        self.processes.with(pid, |p| p.state)
    }

    pub fn exit_status(&self, pid: ProcessId) -> Result<Option<i32>, KernelError> {
        self.processes.with(pid, |p| p.exit_status)
    }

    pub fn parent_of(&self, pid: ProcessId) -> Result<Option<ProcessId>, KernelError> {
        self.processes.with(pid, |p| p.parent)
    }

    pub fn children_of(&self, pid: ProcessId) -> Result<Vec<ProcessId>, KernelError> {
        self.processes
            .with(pid, |p| p.children.iter().copied().collect())
    }

    /// Live threads of a process.
    pub fn threads_of(&self, pid: ProcessId) -> Result<Vec<ThreadId>, KernelError> {
        self.processes
            .with(pid, |p| p.threads.iter().copied().collect())
    }

    pub fn fault_report(&self, pid: ProcessId) -> Result<Option<FaultReport>, KernelError> {
        self.processes.with(pid, |p| p.fault)
    }

    #[must_use]
    pub fn thread_exists(&self, tid: ThreadId) -> bool {
        self.threads.contains(tid)
    }

    #[must_use]
    pub fn process_exists(&self, pid: ProcessId) -> bool {
        self.processes.contains(pid)
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.frames.with_lock(|pool| pool.free_frames())
    }

    #[must_use]
    pub fn frame_refs(&self, frame: Frame) -> u32 {
        self.frames.with_lock(|pool| pool.ref_count(frame))
    }

    /// Software translation of `va` in the address space of `pid`.
    pub fn translate(
        &self,
        pid: ProcessId,
        va: VirtualAddress,
    ) -> Result<Option<Translation>, KernelError> {
        self.processes.with(pid, |p| {
            p.space
                .as_ref()
                .and_then(|space| self.with_vm(|ctx| space.translate(ctx, va)))
        })
    }

    /// Runs `f` on the address space of `pid` under its VM lock.
    pub fn with_address_space<R>(
        &self,
        pid: ProcessId,
        f: impl FnOnce(&mut AddressSpace, VmContext<'_>) -> R,
    ) -> Result<R, KernelError> {
        self.processes.with(pid, |p| {
            let space = p.space.as_mut().ok_or(KernelError::NoSuchEntity)?;
            Ok(self.with_vm(|ctx| f(space, ctx)))
        })?
    }

    pub(crate) fn root_of(&self, pid: ProcessId) -> Option<Frame> {
        self.processes
            .with(pid, |p| p.space.as_ref().map(AddressSpace::root))
            .ok()
            .flatten()
    }
}
