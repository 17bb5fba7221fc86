//! # Process and thread lifecycle
//!
//! ```text
//! spawn_process / fork ──► Alive ──(last thread exits)──► Zombie ──(wait)──► reaped
//!                            │
//!                            └─ children reparented to init when it dies
//! ```
//!
//! A process's address space is destroyed once its last thread is off the
//! processor; its control blocks stay in the store until the parent reaps it.

use crate::Kernel;
use crate::config::{KERNEL_PID, Priority};
use crate::cpu::Context;
use crate::error::{KernelError, halt};
use crate::process::{FaultReport, Pcb, ProcessId};
use crate::sync::Continuation;
use crate::thread::{Tcb, ThreadId, ThreadState};
use alloc::vec::Vec;
use core::task::Poll;
use kernel_sync::IrqGuard;
use kernel_vmem::{Access, AddressSpace, Backing, Permissions, VirtualAddress, VmContext, VmError};

/// One region of a loaded image.
#[derive(Debug, Copy, Clone)]
pub struct Segment<'d> {
    pub start: VirtualAddress,
    pub len: u64,
    pub permissions: Permissions,
    pub backing: Backing<'d>,
}

/// Initial user stack: `[top - len, top)`, read-write.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StackSpec {
    pub top: VirtualAddress,
    pub len: u64,
    /// Back pages on first touch instead of up front.
    pub lazy: bool,
}

/// What the loader hands to [`Kernel::spawn_process`] and [`Kernel::exec`].
#[derive(Debug, Clone)]
pub struct LoadedImage<'d> {
    pub entry: VirtualAddress,
    pub segments: Vec<Segment<'d>>,
    pub stack: Option<StackSpec>,
}

impl<'d> LoadedImage<'d> {
    #[must_use]
    pub const fn new(entry: VirtualAddress) -> Self {
        Self {
            entry,
            segments: Vec::new(),
            stack: None,
        }
    }

    #[must_use]
    pub fn with_segment(
        mut self,
        start: VirtualAddress,
        len: u64,
        permissions: Permissions,
        backing: Backing<'d>,
    ) -> Self {
        self.segments.push(Segment {
            start,
            len,
            permissions,
            backing,
        });
        self
    }

    /// Reserves a stack that is populated on demand.
    #[must_use]
    pub const fn with_stack(mut self, top: VirtualAddress, len: u64) -> Self {
        self.stack = Some(StackSpec {
            top,
            len,
            lazy: true,
        });
        self
    }

    /// Reserves a stack that is populated up front.
    #[must_use]
    pub const fn with_eager_stack(mut self, top: VirtualAddress, len: u64) -> Self {
        self.stack = Some(StackSpec {
            top,
            len,
            lazy: false,
        });
        self
    }

    /// Initial stack pointer, zero without a stack.
    #[must_use]
    pub const fn stack_top(&self) -> VirtualAddress {
        match self.stack {
            Some(stack) => stack.top,
            None => VirtualAddress::new(0),
        }
    }

    /// Builds a fresh address space holding the image. Nothing is left
    /// allocated on failure.
    pub fn build(&self, ctx: VmContext<'_>) -> Result<AddressSpace, VmError> {
        let mut space = AddressSpace::create(ctx)?;
        if let Err(e) = self.install(&mut space, ctx) {
            space.destroy(ctx);
            return Err(e);
        }
        if !space.validate_range(self.entry, 1, Access::Execute) {
            log::warn!("image entry {} is not executable", self.entry);
            space.destroy(ctx);
            return Err(VmError::InvalidRange);
        }
        Ok(space)
    }

    fn install(&self, space: &mut AddressSpace, ctx: VmContext<'_>) -> Result<(), VmError> {
        for segment in &self.segments {
            space.map(
                ctx,
                segment.start,
                segment.len,
                segment.permissions,
                segment.backing,
            )?;
        }
        if let Some(stack) = self.stack {
            let base = stack
                .top
                .as_u64()
                .checked_sub(stack.len)
                .ok_or(VmError::InvalidRange)?;
            let backing = if stack.lazy {
                Backing::Lazy
            } else {
                Backing::Zeroed
            };
            space.map(
                ctx,
                VirtualAddress::new(base),
                stack.len,
                Permissions::READ_WRITE,
                backing,
            )?;
        }
        Ok(())
    }
}

impl Kernel {
    /// Creates a process from `image` with one runnable thread at its entry.
    ///
    /// The first process spawned becomes init. Later processes are children
    /// of the calling process, or of init when called from the kernel.
    pub fn spawn_process(
        &self,
        image: &LoadedImage<'_>,
    ) -> Result<(ProcessId, ThreadId), KernelError> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        let space = self.with_vm(|ctx| image.build(ctx))?;
        let parent = match self.current_process() {
            KERNEL_PID => self.init_pid(),
            pid => Some(pid),
        };
        let context = Context::user(image.entry, image.stack_top(), 0);
        let (pid, tid) = self.install_process(parent, space, context, self.config.default_priority)?;

        if parent.is_none() && self.init.set(pid).is_err() {
            halt(format_args!("second parentless process {pid}"));
        }
        log::debug!(
            "spawned {pid} ({tid}) at {} under {parent:?}",
            image.entry
        );
        Ok((pid, tid))
    }

    /// Registers a new process owning `space` with one thread running
    /// `context`. Rolls everything back if a control block is unavailable.
    fn install_process(
        &self,
        parent: Option<ProcessId>,
        space: AddressSpace,
        context: Context,
        priority: Priority,
    ) -> Result<(ProcessId, ThreadId), KernelError> {
        let (pid, pcb) = match self
            .processes
            .insert_with(|pid| Pcb::new(pid, parent, None))
        {
            Ok(entry) => entry,
            Err(e) => {
                self.with_vm(|ctx| space.destroy(ctx));
                return Err(e);
            }
        };
        let tid = match self.threads.insert_with(|tid| {
            Tcb::new(tid, pid, context, priority, self.config.kernel_stack_size)
        }) {
            Ok((tid, _)) => tid,
            Err(e) => {
                let _ = self.processes.remove(pid);
                self.with_vm(|ctx| space.destroy(ctx));
                return Err(e);
            }
        };

        {
            let mut pcb = pcb.lock();
            pcb.space = Some(space);
            pcb.threads.insert(tid);
        }
        if let Some(parent) = parent {
            self.processes.with(parent, |p| p.children.insert(pid))?;
        }
        self.make_runnable(tid);
        Ok((pid, tid))
    }

    /// Duplicates the calling process. The child's only thread resumes with
    /// the caller's registers and a zero return value; the caller gets the
    /// child's id.
    ///
    /// On failure neither process is changed and nothing stays allocated.
    pub fn fork(&self) -> Result<ProcessId, KernelError> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        let tid = self.current_thread();
        let pid = self.pid_of(tid)?;
        if pid == KERNEL_PID {
            return Err(KernelError::InvalidArgument);
        }
        let priority = self.priority_of(tid)?;
        if self.processes.is_full() || self.threads.is_full() {
            return Err(KernelError::OutOfMemory);
        }

        let space = self.processes.with(pid, |p| {
            let space = p.space.as_mut().ok_or(KernelError::NoSuchEntity)?;
            self.with_vm(|ctx| space.fork(ctx)).map_err(KernelError::from)
        })??;

        let mut context = Context::default();
        self.cpu.save(&mut context);
        context.set_return(0, 0);

        let (child, child_tid) = self.install_process(Some(pid), space, context, priority)?;
        log::debug!("{pid} forked {child} ({child_tid})");
        Ok(child)
    }

    /// Adds a thread to `pid` that starts at `entry` with `arg` in its first
    /// argument register.
    pub fn create_thread(
        &self,
        pid: ProcessId,
        entry: VirtualAddress,
        stack_top: VirtualAddress,
        arg: u64,
    ) -> Result<ThreadId, KernelError> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        let entry_ok = self.processes.with(pid, |p| {
            if !p.is_alive() {
                return Err(KernelError::NoSuchEntity);
            }
            let space = p.space.as_ref().ok_or(KernelError::NoSuchEntity)?;
            Ok(space.validate_range(entry, 1, Access::Execute))
        })??;
        if !entry_ok {
            return Err(KernelError::InvalidArgument);
        }

        let priority = self
            .priority_of(self.current_thread())
            .unwrap_or(self.config.default_priority);
        let context = Context::user(entry, stack_top, arg);
        let (tid, _) = self.threads.insert_with(|tid| {
            Tcb::new(tid, pid, context, priority, self.config.kernel_stack_size)
        })?;
        self.processes.with(pid, |p| p.threads.insert(tid))?;
        self.make_runnable(tid);
        log::debug!("{pid} gained {tid} at {entry}");
        Ok(tid)
    }

    /// Ends the current thread. If it was the last one of its process, the
    /// process exits with `status`.
    pub fn exit(&self, status: i32) {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        let tid = self.current_thread();
        if self.is_idle(tid) {
            halt(format_args!("idle thread exited with status {status}"));
        }
        self.retire_thread(tid, status);
        self.reschedule();
    }

    /// Marks `tid` exited and withdraws it from queues. The last thread of a
    /// process takes the process with it.
    fn retire_thread(&self, tid: ThreadId, status: i32) {
        let Ok((pid, continuation)) = self.threads.with(tid, |t| {
            t.state = ThreadState::Exited;
            t.exit_status = Some(status);
            (t.pid, t.continuation.take())
        }) else {
            return;
        };
        if let Some(continuation) = continuation {
            continuation.cancel(self, tid);
        }
        self.sched.lock().dequeue(tid);

        // A thread leaving a live process is released as soon as it is off
        // the processor. Threads of a dying process stay for the reap.
        let last = self
            .processes
            .with(pid, |p| {
                p.threads.remove(&tid);
                let last = p.threads.is_empty();
                if last || p.exit_status.is_some() {
                    p.dead_threads.push(tid);
                }
                last
            })
            .unwrap_or(false);
        log::debug!("{tid} of {pid} exited with status {status}");
        if last {
            self.process_death(pid, status);
        }
    }

    /// Turns `pid` into a zombie, hands its children to init and notifies
    /// its parent.
    fn process_death(&self, pid: ProcessId, status: i32) {
        if Some(pid) == self.init_pid() {
            halt(format_args!("init exited with status {status}"));
        }
        let Ok((parent, children, zombies, status)) = self.processes.with(pid, |p| {
            p.state = crate::process::ProcessState::Zombie;
            let status = *p.exit_status.get_or_insert(status);
            (
                p.parent,
                core::mem::take(&mut p.children),
                core::mem::take(&mut p.zombies),
                status,
            )
        }) else {
            return;
        };
        self.reparent(pid, children.into_iter().collect(), zombies.into_iter().collect());

        let Some(parent) = parent else {
            halt(format_args!("{pid} died without a parent"));
        };
        let notified = self.processes.with(parent, |p| {
            p.zombies.push_back(pid);
            self.wake_one(&mut p.reap_waiters);
        });
        if notified.is_err() {
            halt(format_args!("parent {parent} of {pid} is gone"));
        }
        log::debug!("{pid} exited with status {status}");

        if self.pid_of(self.current_thread()).ok() != Some(pid) {
            self.teardown(pid);
        }
    }

    /// Moves the children of a dying process under init. Exited children
    /// stay reapable; a waiter of init is woken for each.
    fn reparent(&self, from: ProcessId, children: Vec<ProcessId>, zombies: Vec<ProcessId>) {
        if children.is_empty() {
            return;
        }
        let Some(init) = self.init_pid() else {
            halt(format_args!("orphans of {from} without init"));
        };
        for child in &children {
            let _ = self.processes.with(*child, |p| p.parent = Some(init));
        }
        let adopted = self.processes.with(init, |p| {
            p.children.extend(children.iter().copied());
            for zombie in &zombies {
                p.zombies.push_back(*zombie);
                self.wake_one(&mut p.reap_waiters);
            }
        });
        if adopted.is_err() {
            halt(format_args!("init is gone"));
        }
        log::debug!("{} children of {from} reparented to {init}", children.len());
    }

    /// Waits for any child of the calling process to exit and reaps it.
    ///
    /// Fails with [`KernelError::NoSuchEntity`] if the caller has no
    /// unreaped children.
    pub fn wait(&self) -> Poll<Result<(ProcessId, i32), KernelError>> {
        self.run_blocking(|tid| self.reap_child(tid, false))
    }

    /// Reaps an exited child of the process of `tid` or blocks `tid`.
    pub(crate) fn reap_child(
        &self,
        tid: ThreadId,
        retry: bool,
    ) -> Poll<Result<(ProcessId, i32), KernelError>> {
        let pid = match self.pid_of(tid) {
            Ok(pid) => pid,
            Err(e) => return Poll::Ready(Err(e)),
        };
        let found = self.processes.with(pid, |p| {
            if let Some(zombie) = p.zombies.pop_front() {
                p.children.remove(&zombie);
                return Some(Ok(zombie));
            }
            if p.children.is_empty() {
                return Some(Err(KernelError::NoSuchEntity));
            }
            if retry {
                p.reap_waiters.push_front(tid);
            } else {
                p.reap_waiters.push_back(tid);
            }
            self.block_current(Continuation::Reap);
            None
        });
        match found {
            Err(e) | Ok(Some(Err(e))) => Poll::Ready(Err(e)),
            Ok(Some(Ok(zombie))) => Poll::Ready(self.reap(zombie)),
            Ok(None) => Poll::Pending,
        }
    }

    /// Removes a zombie and its threads from the store.
    fn reap(&self, pid: ProcessId) -> Result<(ProcessId, i32), KernelError> {
        let pcb = self.processes.remove(pid)?;
        let mut pcb = pcb.lock();
        let status = pcb.exit_status.unwrap_or(0);
        for tid in pcb.dead_threads.drain(..) {
            let _ = self.threads.remove(tid);
        }
        if let Some(space) = pcb.space.take() {
            self.with_vm(|ctx| space.destroy(ctx));
        }
        log::debug!("reaped {pid} with status {status}");
        Ok((pid, status))
    }

    pub(crate) fn cancel_reap(&self, tid: ThreadId) {
        if let Ok(pid) = self.pid_of(tid) {
            let _ = self.processes.with(pid, |p| p.reap_waiters.remove(tid));
        }
    }

    /// Replaces the address space of the calling process with `image` and
    /// restarts the caller at its entry point.
    ///
    /// Only single-threaded processes may exec. On failure the process is
    /// unchanged.
    pub fn exec(&self, image: &LoadedImage<'_>) -> Result<(), KernelError> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        let tid = self.current_thread();
        let pid = self.pid_of(tid)?;
        if pid == KERNEL_PID || self.processes.with(pid, |p| p.threads.len())? != 1 {
            return Err(KernelError::InvalidArgument);
        }

        let space = self.with_vm(|ctx| image.build(ctx))?;
        let root = space.root();
        let old = self.processes.with(pid, |p| p.space.replace(space))?;
        self.cpu.activate(Some(root));
        if let Some(old) = old {
            self.with_vm(|ctx| old.destroy(ctx));
        }

        let context = Context::user(image.entry, image.stack_top(), 0);
        self.cpu.restore(&context);
        self.threads.with(tid, |t| t.context = context)?;
        log::debug!("{pid} exec'd at {}", image.entry);
        Ok(())
    }

    /// Terminates every thread of the process named in `report` and records
    /// the fault.
    pub(crate) fn kill_process(&self, report: FaultReport) {
        log::error!(
            "fatal fault: tid={} pid={} address={} access={:?} cause={}",
            report.tid,
            report.pid,
            report.address,
            report.access,
            report.cause
        );
        let status = self.config.fault_exit_status;
        let Ok(threads) = self.processes.with(report.pid, |p| {
            p.fault = Some(report);
            p.exit_status.get_or_insert(status);
            p.threads.iter().copied().collect::<Vec<_>>()
        }) else {
            return;
        };
        for tid in threads {
            self.retire_thread(tid, status);
        }
    }
}
