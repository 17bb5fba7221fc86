//! # System-call dispatch
//!
//! The trap handler leaves the caller's registers on the processor and calls
//! [`Kernel::syscall`]. The number is taken from `rax`, arguments from
//! `rdi, rsi, rdx, r10, r8, r9`. Results go to `rax` (and `rdx` where a call
//! returns two values); errors are negative [`KernelError::code`]s.
//!
//! Synchronization objects are created through system calls and named by
//! an [`ObjectId`] that is only valid within the creating process.

use crate::Kernel;
use crate::cpu::Context;
use crate::error::KernelError;
use crate::process::ProcessId;
use crate::store::StoreId;
use crate::sync::{Condvar, Mutex, RwLock, Semaphore};
use crate::thread::{Completion, ThreadId};
use alloc::sync::Arc;
use alloc::vec;
use core::task::Poll;
use kernel_sync::IrqGuard;
use kernel_vmem::info::PAGE_SIZE;
use kernel_vmem::{Access, Backing, Permissions, VirtualAddress};

/// Longest message accepted by [`Sysno::DebugWrite`].
pub const DEBUG_WRITE_MAX: u64 = 4 * PAGE_SIZE;

#[repr(u64)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Sysno {
    /// `exit(status)`; does not return.
    Exit = 1,
    /// `fork() -> child pid` in the parent, `0` in the child.
    Fork = 2,
    /// `wait() -> (pid, status)`.
    Wait = 3,
    /// `yield(tid)`; `0` yields to anyone.
    Yield = 4,
    /// `thread_create(entry, stack_top, arg) -> tid`.
    ThreadCreate = 5,
    GetPid = 6,
    GetTid = 7,
    /// `set_priority(tid, priority)`.
    SetPriority = 8,
    /// `debug_write(ptr, len)`; logs the bytes.
    DebugWrite = 9,
    /// `mmap(addr, len, prot)`; anonymous, backed on first touch.
    /// `prot` bits: 1 read, 2 write, 4 execute.
    MemoryMap = 10,
    /// `munmap(addr, len)`.
    MemoryUnmap = 11,
    /// `deschedule(reject)`; parks the caller unless `*reject != 0`.
    Deschedule = 14,
    /// `make_runnable(tid)` for a thread parked by `deschedule`.
    MakeRunnable = 15,

    MutexCreate = 16,
    MutexLock = 17,
    /// `-> 1` if acquired, `0` if owned by another thread.
    MutexTryLock = 18,
    MutexUnlock = 19,

    CondCreate = 24,
    /// `cond_wait(cond, mutex)`.
    CondWait = 25,
    CondSignal = 26,
    /// `-> number of woken threads`.
    CondBroadcast = 27,

    /// `sem_create(initial) -> id`.
    SemCreate = 32,
    SemDown = 33,
    SemTryDown = 34,
    SemUp = 35,

    RwLockCreate = 40,
    RwLockRead = 41,
    RwLockWrite = 42,
    RwLockUnlock = 43,
    RwLockDowngrade = 44,
}

impl TryFrom<u64> for Sysno {
    type Error = KernelError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Exit,
            2 => Self::Fork,
            3 => Self::Wait,
            4 => Self::Yield,
            5 => Self::ThreadCreate,
            6 => Self::GetPid,
            7 => Self::GetTid,
            8 => Self::SetPriority,
            9 => Self::DebugWrite,
            10 => Self::MemoryMap,
            11 => Self::MemoryUnmap,
            14 => Self::Deschedule,
            15 => Self::MakeRunnable,
            16 => Self::MutexCreate,
            17 => Self::MutexLock,
            18 => Self::MutexTryLock,
            19 => Self::MutexUnlock,
            24 => Self::CondCreate,
            25 => Self::CondWait,
            26 => Self::CondSignal,
            27 => Self::CondBroadcast,
            32 => Self::SemCreate,
            33 => Self::SemDown,
            34 => Self::SemTryDown,
            35 => Self::SemUp,
            40 => Self::RwLockCreate,
            41 => Self::RwLockRead,
            42 => Self::RwLockWrite,
            43 => Self::RwLockUnlock,
            44 => Self::RwLockDowngrade,
            _ => return Err(KernelError::InvalidArgument),
        })
    }
}

/// Handle of a synchronization object created by a process.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl StoreId for ObjectId {
    fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// A synchronization object together with the process that created it.
pub struct SyncObject {
    owner: ProcessId,
    kind: ObjectKind,
}

#[derive(Clone)]
enum ObjectKind {
    Mutex(Arc<Mutex>),
    Condvar(Arc<Condvar>),
    Semaphore(Arc<Semaphore>),
    RwLock(Arc<RwLock>),
}

fn ready<T>(result: Result<T, KernelError>, f: impl FnOnce(T) -> (u64, u64)) -> Poll<Completion> {
    Poll::Ready(result.map(f))
}

const fn unit((): ()) -> (u64, u64) {
    (0, 0)
}

#[allow(clippy::cast_possible_truncation)]
const fn status_arg(raw: u64) -> i32 {
    raw as i32
}

impl Kernel {
    /// System-call entry for the current thread.
    ///
    /// Returns the result that was placed in the caller's return registers,
    /// or [`Poll::Pending`] if the caller blocked or exited and another
    /// thread is now running.
    pub fn syscall(&self) -> Poll<Completion> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        let tid = self.current_thread();
        let mut regs = Context::default();
        self.cpu.save(&mut regs);

        let number = regs.syscall_number();
        let poll = match Sysno::try_from(number) {
            Ok(sysno) => {
                log::trace!("{tid}: {sysno:?}{:x?}", regs.syscall_args());
                self.dispatch(sysno, regs.syscall_args())
            }
            Err(e) => {
                log::warn!("{tid}: unknown system call {number}");
                Poll::Ready(Err(e))
            }
        };
        if let Poll::Ready(result) = poll {
            self.deliver(tid, result);
        }
        poll
    }

    fn dispatch(&self, sysno: Sysno, args: [u64; 6]) -> Poll<Completion> {
        let [a0, a1, a2, ..] = args;
        match sysno {
            Sysno::Exit => {
                self.exit(status_arg(a0));
                Poll::Pending
            }
            Sysno::Fork => ready(self.fork(), |child| (child.as_u64(), 0)),
            Sysno::Wait => self
                .wait()
                .map(|r| r.map(|(pid, status)| (pid.as_u64(), i64::from(status).cast_unsigned()))),
            Sysno::Yield => {
                let target = (a0 != 0).then_some(ThreadId::new(a0));
                ready(self.yield_to(target), unit)
            }
            Sysno::ThreadCreate => {
                let pid = self.current_process();
                let created = self.create_thread(
                    pid,
                    VirtualAddress::new(a0),
                    VirtualAddress::new(a1),
                    a2,
                );
                ready(created, |tid| (tid.as_u64(), 0))
            }
            Sysno::GetPid => Poll::Ready(Ok((self.current_process().as_u64(), 0))),
            Sysno::GetTid => Poll::Ready(Ok((self.current_thread().as_u64(), 0))),
            Sysno::SetPriority => {
                let result = u8::try_from(a1)
                    .map_err(|_| KernelError::InvalidArgument)
                    .and_then(|priority| self.set_priority(ThreadId::new(a0), priority));
                ready(result, unit)
            }
            Sysno::DebugWrite => self.debug_write(VirtualAddress::new(a0), a1),
            Sysno::MemoryMap => {
                let result = prot_bits(a2).and_then(|permissions| {
                    self.map_region(VirtualAddress::new(a0), a1, permissions, Backing::Lazy)
                });
                ready(result, unit)
            }
            Sysno::MemoryUnmap => ready(self.unmap_region(VirtualAddress::new(a0), a1), unit),
            Sysno::Deschedule => self.deschedule(VirtualAddress::new(a0)).map(|r| r.map(unit)),
            Sysno::MakeRunnable => ready(self.wake_descheduled(ThreadId::new(a0)), unit),

            Sysno::MutexCreate => self.create_object(ObjectKind::Mutex(Arc::new(Mutex::new()))),
            Sysno::MutexLock => match self.mutex_object(a0) {
                Ok(m) => self.mutex_lock(&m).map(|r| r.map(unit)),
                Err(e) => Poll::Ready(Err(e)),
            },
            Sysno::MutexTryLock => ready(
                self.mutex_object(a0).and_then(|m| self.mutex_try_lock(&m)),
                |acquired| (u64::from(acquired), 0),
            ),
            Sysno::MutexUnlock => ready(
                self.mutex_object(a0).and_then(|m| self.mutex_unlock(&m)),
                unit,
            ),

            Sysno::CondCreate => {
                self.create_object(ObjectKind::Condvar(Arc::new(Condvar::new())))
            }
            Sysno::CondWait => match (self.cond_object(a0), self.mutex_object(a1)) {
                (Ok(cond), Ok(mutex)) => self.cond_wait(&cond, &mutex).map(|r| r.map(unit)),
                (Err(e), _) | (_, Err(e)) => Poll::Ready(Err(e)),
            },
            Sysno::CondSignal => ready(self.cond_object(a0), |c| {
                (u64::from(self.cond_signal(&c)), 0)
            }),
            Sysno::CondBroadcast => ready(self.cond_object(a0), |c| {
                (self.cond_broadcast(&c) as u64, 0)
            }),

            Sysno::SemCreate => {
                self.create_object(ObjectKind::Semaphore(Arc::new(Semaphore::new(a0))))
            }
            Sysno::SemDown => match self.sem_object(a0) {
                Ok(s) => self.sem_down(&s).map(|r| r.map(unit)),
                Err(e) => Poll::Ready(Err(e)),
            },
            Sysno::SemTryDown => ready(self.sem_object(a0), |s| {
                (u64::from(self.sem_try_down(&s)), 0)
            }),
            Sysno::SemUp => ready(self.sem_object(a0).and_then(|s| self.sem_up(&s)), unit),

            Sysno::RwLockCreate => self.create_object(ObjectKind::RwLock(Arc::new(RwLock::new(
                self.config.rwlock_reader_batch,
            )))),
            Sysno::RwLockRead => match self.rwlock_object(a0) {
                Ok(l) => self.rw_read(&l).map(|r| r.map(unit)),
                Err(e) => Poll::Ready(Err(e)),
            },
            Sysno::RwLockWrite => match self.rwlock_object(a0) {
                Ok(l) => self.rw_write(&l).map(|r| r.map(unit)),
                Err(e) => Poll::Ready(Err(e)),
            },
            Sysno::RwLockUnlock => ready(
                self.rwlock_object(a0).and_then(|l| self.rw_unlock(&l)),
                unit,
            ),
            Sysno::RwLockDowngrade => ready(
                self.rwlock_object(a0).and_then(|l| self.rw_downgrade(&l)),
                unit,
            ),
        }
    }

    /// Places `result` in the return registers of `tid`: the live registers
    /// if it is running, its saved context otherwise.
    fn deliver(&self, tid: ThreadId, result: Completion) {
        let (primary, secondary) = match result {
            Ok(values) => values,
            Err(e) => (e.code().cast_unsigned(), 0),
        };
        if self.current_thread() == tid {
            let mut regs = Context::default();
            self.cpu.save(&mut regs);
            regs.set_return(primary, secondary);
            self.cpu.restore(&regs);
        } else {
            let _ = self
                .threads
                .with(tid, |t| t.context.set_return(primary, secondary));
        }
    }

    fn debug_write(&self, va: VirtualAddress, len: u64) -> Poll<Completion> {
        if len > DEBUG_WRITE_MAX {
            return Poll::Ready(Err(KernelError::InvalidArgument));
        }
        if let Err(e) = self.validate_user_range(va, len, Access::Read) {
            return Poll::Ready(Err(e));
        }
        let Ok(len) = usize::try_from(len) else {
            return Poll::Ready(Err(KernelError::InvalidArgument));
        };
        let pid = self.current_process();
        let mut buf = vec![0u8; len];
        match self.user_read(va, &mut buf) {
            Ok(()) => {
                log::info!("{pid}: {}", alloc::string::String::from_utf8_lossy(&buf));
                Poll::Ready(Ok((len as u64, 0)))
            }
            Err(_) => Poll::Pending,
        }
    }

    /// Maps a region into the calling process.
    pub fn map_region(
        &self,
        start: VirtualAddress,
        len: u64,
        permissions: Permissions,
        backing: Backing<'_>,
    ) -> Result<(), KernelError> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        let pid = self.current_process();
        self.with_address_space(pid, |space, ctx| {
            space.map(ctx, start, len, permissions, backing)
        })?
        .map_err(KernelError::from)
    }

    /// Unmaps a region of the calling process. `start` and `len` must name
    /// a whole region.
    pub fn unmap_region(&self, start: VirtualAddress, len: u64) -> Result<(), KernelError> {
        let _irq = IrqGuard::new(self.cpu.interrupts());
        let pid = self.current_process();
        self.with_address_space(pid, |space, ctx| space.unmap(ctx, start, len))?
            .map(|_| ())
            .map_err(KernelError::from)
    }

    fn create_object(&self, kind: ObjectKind) -> Poll<Completion> {
        let owner = self.current_process();
        ready(
            self.objects.insert_with(|_| SyncObject { owner, kind }),
            |(id, _)| (id.as_u64(), 0),
        )
    }

    fn object(&self, raw: u64) -> Result<ObjectKind, KernelError> {
        let pid = self.current_process();
        self.objects.with(ObjectId(raw), |o| {
            if o.owner == pid {
                Ok(o.kind.clone())
            } else {
                Err(KernelError::NoSuchEntity)
            }
        })?
    }

    fn mutex_object(&self, raw: u64) -> Result<Arc<Mutex>, KernelError> {
        match self.object(raw)? {
            ObjectKind::Mutex(m) => Ok(m),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    fn cond_object(&self, raw: u64) -> Result<Arc<Condvar>, KernelError> {
        match self.object(raw)? {
            ObjectKind::Condvar(c) => Ok(c),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    fn sem_object(&self, raw: u64) -> Result<Arc<Semaphore>, KernelError> {
        match self.object(raw)? {
            ObjectKind::Semaphore(s) => Ok(s),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    fn rwlock_object(&self, raw: u64) -> Result<Arc<RwLock>, KernelError> {
        match self.object(raw)? {
            ObjectKind::RwLock(l) => Ok(l),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Drops the synchronization objects created by `pid`.
    pub(crate) fn release_objects(&self, pid: ProcessId) {
        for id in self.objects.ids() {
            let owned = self.objects.with(id, |o| o.owner == pid).unwrap_or(false);
            if owned {
                let _ = self.objects.remove(id);
            }
        }
    }
}

/// Region permissions from `mmap` protection bits.
fn prot_bits(raw: u64) -> Result<Permissions, KernelError> {
    if raw & !0b111 != 0 || raw == 0 {
        return Err(KernelError::InvalidArgument);
    }
    Ok(Permissions::new()
        .with_read(raw & 1 != 0)
        .with_write(raw & 2 != 0)
        .with_execute(raw & 4 != 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_round_trip() {
        for sysno in [
            Sysno::Exit,
            Sysno::Wait,
            Sysno::MutexUnlock,
            Sysno::RwLockDowngrade,
            Sysno::Deschedule,
        ] {
            assert_eq!(Sysno::try_from(sysno as u64), Ok(sysno));
        }
        assert_eq!(Sysno::try_from(12u64), Err(KernelError::InvalidArgument));
        assert_eq!(Sysno::try_from(0u64), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn protection_bits() {
        assert_eq!(prot_bits(0b011), Ok(Permissions::READ_WRITE));
        assert_eq!(prot_bits(0b101), Ok(Permissions::READ_EXECUTE));
        assert_eq!(prot_bits(0), Err(KernelError::InvalidArgument));
        assert_eq!(prot_bits(0b1000), Err(KernelError::InvalidArgument));
    }
}
