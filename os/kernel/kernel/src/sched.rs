//! # Scheduler
//!
//! Single-processor run queue with round-robin and priority policies.
//!
//! Threads enter the run queue when created, preempted, yielding or woken.
//! The idle thread is never queued: [`Scheduler::pick_next`] falls back to
//! it when the queue holds nothing runnable.
//!
//! A thread parked in a blocking call carries a [`Continuation`]. When the
//! scheduler picks it, the continuation runs first and either completes the
//! call, in which case its result is written into the thread's return
//! registers, or parks the thread again and the scheduler picks anew.

use crate::Kernel;
use crate::config::SchedPolicy;
use crate::error::{KernelError, halt};
use crate::store::ControlBlockStore;
use crate::sync::Continuation;
use crate::thread::{Completion, Tcb, ThreadId, ThreadState};
use crate::wait_queue::WaitQueue;
use crate::{Priority, ProcessId};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::task::Poll;
use kernel_sync::IrqGuard;
use kernel_vmem::{Access, VirtualAddress};

pub(crate) struct Scheduler {
    pub(crate) current: ThreadId,
    idle: ThreadId,
    run_queue: VecDeque<ThreadId>,
    /// Thread to pick next regardless of queue order, if still runnable.
    pub(crate) directed: Option<ThreadId>,
    policy: SchedPolicy,
    pub(crate) ticks: u64,
    pub(crate) switches: u64,
}

impl Scheduler {
    pub(crate) const fn new(idle: ThreadId, policy: SchedPolicy) -> Self {
        Self {
            current: idle,
            idle,
            run_queue: VecDeque::new(),
            directed: None,
            policy,
            ticks: 0,
            switches: 0,
        }
    }

    pub(crate) const fn idle(&self) -> ThreadId {
        self.idle
    }

    fn enqueue(&mut self, tid: ThreadId) {
        if tid != self.idle && !self.run_queue.contains(&tid) {
            self.run_queue.push_back(tid);
        }
    }

    pub(crate) fn dequeue(&mut self, tid: ThreadId) {
        self.run_queue.retain(|t| *t != tid);
        if self.directed == Some(tid) {
            self.directed = None;
        }
    }

    fn runnable(threads: &ControlBlockStore<ThreadId, Tcb>, tid: ThreadId) -> bool {
        threads
            .with(tid, |t| t.state == ThreadState::Runnable)
            .unwrap_or(false)
    }

    fn priority(threads: &ControlBlockStore<ThreadId, Tcb>, tid: ThreadId) -> Priority {
        threads.with(tid, |t| t.priority).unwrap_or(0)
    }

    /// Highest priority among queued runnable threads.
    fn best_waiting(&self, threads: &ControlBlockStore<ThreadId, Tcb>) -> Option<Priority> {
        self.run_queue
            .iter()
            .filter(|tid| Self::runnable(threads, **tid))
            .map(|tid| Self::priority(threads, *tid))
            .max()
    }

    /// Selects the next thread to run and removes it from the queue.
    ///
    /// Never returns a thread whose control block is absent or that is not
    /// runnable. Halts if not even the idle thread is available.
    fn pick_next(&mut self, threads: &ControlBlockStore<ThreadId, Tcb>) -> ThreadId {
        if let Some(tid) = self.directed.take()
            && let Some(index) = self.run_queue.iter().position(|t| *t == tid)
            && Self::runnable(threads, tid)
        {
            self.run_queue.remove(index);
            return tid;
        }

        self.run_queue.retain(|tid| Self::runnable(threads, *tid));
        let index = match self.policy {
            SchedPolicy::RoundRobin => (!self.run_queue.is_empty()).then_some(0),
            SchedPolicy::Priority => {
                let mut best: Option<(usize, Priority)> = None;
                for (index, tid) in self.run_queue.iter().enumerate() {
                    let priority = Self::priority(threads, *tid);
                    if best.is_none_or(|(_, p)| priority > p) {
                        best = Some((index, priority));
                    }
                }
                best.map(|(index, _)| index)
            }
        };
        if let Some(tid) = index.and_then(|i| self.run_queue.remove(i)) {
            return tid;
        }

        let idle_ok = threads
            .with(self.idle, |t| t.state != ThreadState::Exited)
            .unwrap_or(false);
        if !idle_ok {
            halt(format_args!("no runnable thread"));
        }
        self.idle
    }

    /// Snapshot of the run queue in queue order.
    pub(crate) fn queued(&self) -> Vec<ThreadId> {
        self.run_queue.iter().copied().collect()
    }
}

impl Kernel {
    /// The thread that is logically executing.
    #[must_use]
    pub fn current_thread(&self) -> ThreadId {
        self.sched.lock().current
    }

    /// Makes `tid` eligible to run. Blocked threads become runnable, threads
    /// already runnable are queued if they are not. Running or exited
    /// threads are left alone.
    pub(crate) fn make_runnable(&self, tid: ThreadId) {
        let mut sched = self.sched.lock();
        let queue = self
            .threads
            .with(tid, |t| match t.state {
                ThreadState::Blocked => {
                    t.state = ThreadState::Runnable;
                    true
                }
                ThreadState::Runnable => true,
                ThreadState::Running | ThreadState::Exited => false,
            })
            .unwrap_or(false);
        if queue {
            sched.enqueue(tid);
            log::trace!("{tid} runnable");
        }
    }

    /// Wakes the first thread of `queue`. Does not switch.
    pub(crate) fn wake_one(&self, queue: &mut WaitQueue) -> Option<ThreadId> {
        let tid = queue.pop()?;
        self.make_runnable(tid);
        Some(tid)
    }

    /// Wakes every thread of `queue` in queue order. Does not switch.
    pub(crate) fn wake_all(&self, queue: &mut WaitQueue) -> usize {
        let woken: Vec<ThreadId> = queue.drain().collect();
        for tid in &woken {
            self.make_runnable(*tid);
        }
        woken.len()
    }

    /// Marks the current thread blocked with the remainder of its call.
    ///
    /// The caller has already queued the thread on a wait queue and still
    /// holds that queue's lock, so no waker can observe the thread queued
    /// but not yet blocked. The caller must reschedule once it has released
    /// its locks.
    pub(crate) fn block_current(&self, continuation: Continuation) {
        let sched = self.sched.lock();
        let tid = sched.current;
        if tid == sched.idle() {
            halt(format_args!("idle thread attempted to block"));
        }
        let _ = self.threads.with(tid, |t| {
            t.state = ThreadState::Blocked;
            t.continuation = Some(continuation);
        });
        log::trace!("{tid} blocked");
    }

    /// Running → Runnable, back to the tail of the run queue.
    fn requeue_current(&self) {
        let mut sched = self.sched.lock();
        let tid = sched.current;
        let running = self
            .threads
            .with(tid, |t| {
                if t.state == ThreadState::Running {
                    t.state = ThreadState::Runnable;
                }
                t.state == ThreadState::Runnable
            })
            .unwrap_or(false);
        if running {
            sched.enqueue(tid);
        }
    }

    /// Directs the next pick to `tid` if it is runnable at that point.
    pub(crate) fn hand_over(&self, tid: ThreadId) {
        self.sched.lock().directed = Some(tid);
    }

    /// Picks the next thread, completes its pending call if it has one and
    /// switches to it.
    ///
    /// The current thread must already be off the processor logically:
    /// requeued, blocked or exited.
    pub(crate) fn reschedule(&self) {
        let from = self.current_thread();
        self.save_context(from);
        self.release_exited(from);

        let to = loop {
            let next = {
                let mut sched = self.sched.lock();
                let next = sched.pick_next(&self.threads);
                sched.current = next;
                next
            };
            let continuation = self
                .threads
                .with(next, |t| {
                    t.state = ThreadState::Running;
                    t.slice_used = 0;
                    t.continuation.take()
                })
                .ok()
                .flatten();
            let Some(continuation) = continuation else {
                break next;
            };
            match continuation.resume(self, next) {
                Poll::Ready(result) => {
                    self.complete(next, result);
                    break next;
                }
                Poll::Pending => log::trace!("{next} parked again"),
            }
        };

        self.switch_to(from, to);
    }

    /// Writes the result of a finished blocking call into the thread.
    fn complete(&self, tid: ThreadId, result: Completion) {
        let _ = self.threads.with(tid, |t| {
            let (primary, secondary) = match result {
                Ok(values) => values,
                Err(e) => (e.code().cast_unsigned(), 0),
            };
            t.context.set_return(primary, secondary);
            t.completion = Some(result);
        });
    }

    /// Gives up the processor. With a target, that thread runs next if it is
    /// runnable; otherwise this is a plain yield.
    pub fn yield_to(&self, target: Option<ThreadId>) -> Result<(), KernelError> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        if let Some(tid) = target {
            if self.thread_state(tid)? == ThreadState::Runnable {
                self.hand_over(tid);
            } else {
                log::trace!("yield target {tid} not runnable");
            }
        }
        self.requeue_current();
        self.reschedule();
        Ok(())
    }

    pub fn yield_now(&self) {
        let _ = self.yield_to(None);
    }

    /// Takes the current thread off the processor until another thread
    /// calls [`Kernel::wake_descheduled`] on it, unless the user word at
    /// `reject` is non-zero. Checking the word and blocking happen with
    /// interrupts off, so a wakeup that clears the way first is not lost.
    pub fn deschedule(&self, reject: VirtualAddress) -> Poll<Result<(), KernelError>> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        if let Err(e) = self.validate_user_range(reject, 4, Access::Read) {
            return Poll::Ready(Err(e));
        }
        let mut word = [0u8; 4];
        if self.user_read(reject, &mut word).is_err() {
            return Poll::Pending;
        }
        if u32::from_ne_bytes(word) != 0 {
            return Poll::Ready(Ok(()));
        }
        self.run_blocking(|_| {
            self.block_current(Continuation::Descheduled);
            Poll::Pending
        })
    }

    /// Makes a thread parked by [`Kernel::deschedule`] runnable again.
    pub fn wake_descheduled(&self, tid: ThreadId) -> Result<(), KernelError> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        let descheduled = self.threads.with(tid, |t| {
            t.state == ThreadState::Blocked
                && matches!(t.continuation, Some(Continuation::Descheduled))
        })?;
        if !descheduled {
            return Err(KernelError::InvalidArgument);
        }
        self.make_runnable(tid);
        Ok(())
    }

    /// Periodic timer callback.
    ///
    /// Preempts the current thread when its slice is used up and another
    /// thread is waiting, or, under [`SchedPolicy::Priority`], as soon as a
    /// thread of higher priority is runnable. The idle thread is preempted
    /// whenever anything is queued.
    pub fn timer_tick(&self) {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        let preempt = {
            let mut sched = self.sched.lock();
            sched.ticks += 1;
            let current = sched.current;
            if current == sched.idle() {
                sched.best_waiting(&self.threads).is_some()
            } else {
                let (used, priority) = self
                    .threads
                    .with(current, |t| {
                        t.slice_used += 1;
                        (t.slice_used, t.priority)
                    })
                    .unwrap_or((0, 0));
                let expired = used >= self.config.time_slice_ticks;
                match (sched.policy, sched.best_waiting(&self.threads)) {
                    (_, None) => false,
                    (SchedPolicy::RoundRobin, Some(_)) => expired,
                    (SchedPolicy::Priority, Some(best)) => {
                        best > priority || (expired && best == priority)
                    }
                }
            }
        };
        if preempt {
            log::trace!("preempting {}", self.current_thread());
            self.requeue_current();
            self.reschedule();
        }
    }

    /// Changes the priority of `tid`. Takes effect at the next scheduling
    /// decision.
    pub fn set_priority(&self, tid: ThreadId, priority: Priority) -> Result<(), KernelError> {
        self.threads.with(tid, |t| {
            if t.state == ThreadState::Exited {
                return Err(KernelError::NoSuchEntity);
            }
            t.priority = priority;
            Ok(())
        })?
    }

    pub fn priority_of(&self, tid: ThreadId) -> Result<Priority, KernelError> {
        self.threads.with(tid, |t| t.priority)
    }

    /// Queued threads in the order the round-robin policy would pick them.
    #[must_use]
    pub fn run_queue(&self) -> Vec<ThreadId> {
        self.sched.lock_irq(self.cpu.interrupts()).queued()
    }

    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.sched.lock_irq(self.cpu.interrupts()).ticks
    }

    /// Number of context switches performed.
    #[must_use]
    pub fn switch_count(&self) -> u64 {
        self.sched.lock_irq(self.cpu.interrupts()).switches
    }

    pub(crate) fn is_idle(&self, tid: ThreadId) -> bool {
        self.sched.lock().idle() == tid
    }

    /// Cleans up after an exited thread once its registers are saved. A
    /// thread that left its process running loses its control block and
    /// kernel stack here; otherwise the process's address space goes once
    /// no thread of it remains.
    fn release_exited(&self, from: ThreadId) {
        let Ok((state, pid)) = self.threads.with(from, |t| (t.state, t.pid)) else {
            return;
        };
        if state != ThreadState::Exited {
            return;
        }
        let kept = self
            .processes
            .with(pid, |p| p.dead_threads.contains(&from))
            .unwrap_or(true);
        if kept {
            self.teardown(pid);
        } else if self.threads.remove(from).is_ok() {
            log::trace!("{from} released");
        }
    }

    /// Destroys the address space of `pid` if it has no live thread left.
    pub(crate) fn teardown(&self, pid: ProcessId) {
        let space = self
            .processes
            .with(pid, |p| {
                if p.threads.is_empty() {
                    p.space.take()
                } else {
                    None
                }
            })
            .ok()
            .flatten();
        if let Some(space) = space {
            if self.cpu.active_root() == Some(space.root()) {
                self.cpu.activate(None);
            }
            self.with_vm(|ctx| space.destroy(ctx));
            self.release_objects(pid);
            log::debug!("{pid} address space released");
        }
    }
}
