//! # Blocking synchronization
//!
//! Mutex, condition variable, semaphore and reader-writer lock for threads.
//! Each primitive keeps its state and wait queues behind one short-section
//! lock. A caller that cannot proceed is queued and blocked while that lock
//! is held, which closes the window for lost wakeups; the switch to another
//! thread happens only after the lock is released.
//!
//! Woken threads do not inherit the resource. They resume through their
//! [`Continuation`], re-check the state and either take the resource or go
//! back to the head of the queue.

mod condvar;
mod mutex;
mod rwlock;
mod semaphore;

pub use condvar::Condvar;
pub use mutex::Mutex;
pub use rwlock::RwLock;
pub use semaphore::Semaphore;

use crate::Kernel;
use crate::error::KernelError;
use crate::thread::{Completion, ThreadId};
use alloc::sync::Arc;
use core::task::Poll;
use kernel_sync::IrqGuard;

/// What a blocked thread still has to do once it is picked again.
pub enum Continuation {
    MutexLock(Arc<Mutex>),
    /// Signalled; reacquire the mutex before returning.
    CondWait {
        cond: Arc<Condvar>,
        mutex: Arc<Mutex>,
    },
    SemDown(Arc<Semaphore>),
    ReadLock(Arc<RwLock>),
    WriteLock(Arc<RwLock>),
    /// Waiting for any child process to exit.
    Reap,
    /// Parked until made runnable by another thread.
    Descheduled,
}

impl Continuation {
    /// Retries the blocked operation on behalf of `tid`, which is the
    /// current thread.
    pub(crate) fn resume(self, kernel: &Kernel, tid: ThreadId) -> Poll<Completion> {
        match self {
            Self::MutexLock(mutex) => mutex.lock(kernel, tid, true).map(done),
            Self::CondWait { mutex, .. } => mutex.lock(kernel, tid, false).map(done),
            Self::SemDown(sem) => sem.down(kernel, tid, true).map(done),
            Self::ReadLock(lock) => lock.read(kernel, tid, true).map(done),
            Self::WriteLock(lock) => lock.write(kernel, tid, true).map(done),
            Self::Reap => kernel.reap_child(tid, true).map(|r| {
                r.map(|(pid, status)| (pid.as_u64(), i64::from(status).cast_unsigned()))
            }),
            Self::Descheduled => Poll::Ready(Ok((0, 0))),
        }
    }

    /// Withdraws `tid` from whatever it waits on. Used when a blocked or
    /// woken-but-not-resumed thread is killed. A wakeup already spent on
    /// `tid` goes to the next waiter.
    pub(crate) fn cancel(&self, kernel: &Kernel, tid: ThreadId) {
        match self {
            Self::MutexLock(mutex) => mutex.cancel(kernel, tid),
            Self::CondWait { cond, .. } => cond.cancel(kernel, tid),
            Self::SemDown(sem) => sem.cancel(kernel, tid),
            Self::ReadLock(lock) => lock.cancel_read(kernel, tid),
            Self::WriteLock(lock) => lock.cancel_write(kernel, tid),
            Self::Reap => kernel.cancel_reap(tid),
            Self::Descheduled => {}
        }
    }
}

impl core::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::MutexLock(_) => "MutexLock",
            Self::CondWait { .. } => "CondWait",
            Self::SemDown(_) => "SemDown",
            Self::ReadLock(_) => "ReadLock",
            Self::WriteLock(_) => "WriteLock",
            Self::Reap => "Reap",
            Self::Descheduled => "Descheduled",
        })
    }
}

fn done(result: Result<(), KernelError>) -> Completion {
    result.map(|()| (0, 0))
}

impl Kernel {
    /// Runs one blocking operation for the current thread and switches away
    /// if it parked.
    pub(crate) fn run_blocking<T>(
        &self,
        op: impl FnOnce(ThreadId) -> Poll<Result<T, KernelError>>,
    ) -> Poll<Result<T, KernelError>> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        let tid = self.current_thread();
        let poll = op(tid);
        if poll.is_pending() {
            self.reschedule();
        }
        poll
    }

    /// Acquires `mutex`, blocking while another thread owns it.
    pub fn mutex_lock(&self, mutex: &Arc<Mutex>) -> Poll<Result<(), KernelError>> {
        self.run_blocking(|tid| mutex.lock(self, tid, false))
    }

    /// Acquires `mutex` if it is free. Returns `false` if it is owned.
    pub fn mutex_try_lock(&self, mutex: &Mutex) -> Result<bool, KernelError> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        mutex.try_lock(self.current_thread())
    }

    /// Releases `mutex`. If a thread was waiting, it runs next and takes the
    /// mutex before any other thread can.
    pub fn mutex_unlock(&self, mutex: &Mutex) -> Result<(), KernelError> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        if let Some(woken) = mutex.unlock(self, self.current_thread())? {
            self.yield_to(Some(woken))?;
        }
        Ok(())
    }

    /// Releases `mutex`, waits for a signal on `cond` and reacquires
    /// `mutex`. The caller must own `mutex`.
    pub fn cond_wait(
        &self,
        cond: &Arc<Condvar>,
        mutex: &Arc<Mutex>,
    ) -> Poll<Result<(), KernelError>> {
        self.run_blocking(|tid| cond.wait(self, tid, mutex))
    }

    /// Wakes one waiter. Returns `false` if nobody waited.
    pub fn cond_signal(&self, cond: &Condvar) -> bool {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        cond.signal(self)
    }

    /// Wakes all waiters and returns how many there were.
    pub fn cond_broadcast(&self, cond: &Condvar) -> usize {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        cond.broadcast(self)
    }

    pub fn sem_down(&self, sem: &Arc<Semaphore>) -> Poll<Result<(), KernelError>> {
        self.run_blocking(|tid| sem.down(self, tid, false))
    }

    /// Decrements the count if it is positive. Returns `false` otherwise.
    pub fn sem_try_down(&self, sem: &Semaphore) -> bool {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        sem.try_down()
    }

    pub fn sem_up(&self, sem: &Semaphore) -> Result<(), KernelError> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        sem.up(self)
    }

    pub fn rw_read(&self, lock: &Arc<RwLock>) -> Poll<Result<(), KernelError>> {
        self.run_blocking(|tid| lock.read(self, tid, false))
    }

    pub fn rw_write(&self, lock: &Arc<RwLock>) -> Poll<Result<(), KernelError>> {
        self.run_blocking(|tid| lock.write(self, tid, false))
    }

    /// Releases a read or write hold of the current thread.
    pub fn rw_unlock(&self, lock: &RwLock) -> Result<(), KernelError> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        lock.unlock(self, self.current_thread())
    }

    /// Turns the current thread's write hold into a read hold without
    /// letting a writer in between.
    pub fn rw_downgrade(&self, lock: &RwLock) -> Result<(), KernelError> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        lock.downgrade(self, self.current_thread())
    }
}
