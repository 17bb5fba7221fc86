use super::Continuation;
use crate::Kernel;
use crate::error::KernelError;
use crate::thread::ThreadId;
use crate::wait_queue::WaitQueue;
use alloc::sync::Arc;
use core::task::Poll;
use kernel_sync::SpinLock;

/// Sleeping mutual-exclusion lock with an owner.
///
/// Unlocking does not hand ownership to a waiter; the woken waiter takes it
/// when it runs, which [`Kernel::mutex_unlock`] arranges to happen next.
pub struct Mutex {
    state: SpinLock<MutexState>,
}

struct MutexState {
    owner: Option<ThreadId>,
    waiters: WaitQueue,
}

impl Mutex {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(MutexState {
                owner: None,
                waiters: WaitQueue::new(),
            }),
        }
    }

    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// Number of blocked waiters.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Takes the mutex for `tid` or blocks `tid`, which must be the current
    /// thread. `retry` marks a woken waiter, which keeps its queue position.
    pub(crate) fn lock(
        self: &Arc<Self>,
        kernel: &Kernel,
        tid: ThreadId,
        retry: bool,
    ) -> Poll<Result<(), KernelError>> {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(tid);
                Poll::Ready(Ok(()))
            }
            Some(owner) if owner == tid => Poll::Ready(Err(KernelError::Deadlock)),
            Some(_) => {
                if retry {
                    state.waiters.push_front(tid);
                } else {
                    state.waiters.push_back(tid);
                }
                kernel.block_current(Continuation::MutexLock(Arc::clone(self)));
                Poll::Pending
            }
        }
    }

    pub(crate) fn try_lock(&self, tid: ThreadId) -> Result<bool, KernelError> {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(tid);
                Ok(true)
            }
            Some(owner) if owner == tid => Err(KernelError::Deadlock),
            Some(_) => Ok(false),
        }
    }

    /// Releases the mutex held by `tid` and wakes the first waiter, which
    /// is returned.
    pub(crate) fn unlock(
        &self,
        kernel: &Kernel,
        tid: ThreadId,
    ) -> Result<Option<ThreadId>, KernelError> {
        let mut state = self.state.lock();
        if state.owner != Some(tid) {
            log::warn!("{tid} unlocking mutex owned by {:?}", state.owner);
            return Err(KernelError::NotOwner);
        }
        state.owner = None;
        Ok(kernel.wake_one(&mut state.waiters))
    }

    pub(crate) fn cancel(&self, kernel: &Kernel, tid: ThreadId) {
        let mut state = self.state.lock();
        if !state.waiters.remove(tid) && state.owner.is_none() {
            kernel.wake_one(&mut state.waiters);
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mutex")
            .field("owner", &state.owner)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
