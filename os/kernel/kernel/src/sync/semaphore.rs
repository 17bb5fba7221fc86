use super::Continuation;
use crate::Kernel;
use crate::error::KernelError;
use crate::thread::ThreadId;
use crate::wait_queue::WaitQueue;
use alloc::sync::Arc;
use core::task::Poll;
use kernel_sync::SpinLock;

/// Counting semaphore.
pub struct Semaphore {
    state: SpinLock<SemState>,
}

struct SemState {
    count: u64,
    waiters: WaitQueue,
}

impl Semaphore {
    #[must_use]
    pub const fn new(initial: u64) -> Self {
        Self {
            state: SpinLock::new(SemState {
                count: initial,
                waiters: WaitQueue::new(),
            }),
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub(crate) fn down(
        self: &Arc<Self>,
        kernel: &Kernel,
        tid: ThreadId,
        retry: bool,
    ) -> Poll<Result<(), KernelError>> {
        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            return Poll::Ready(Ok(()));
        }
        if retry {
            state.waiters.push_front(tid);
        } else {
            state.waiters.push_back(tid);
        }
        kernel.block_current(Continuation::SemDown(Arc::clone(self)));
        Poll::Pending
    }

    pub(crate) fn try_down(&self) -> bool {
        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn up(&self, kernel: &Kernel) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        state.count = state
            .count
            .checked_add(1)
            .ok_or(KernelError::InvalidArgument)?;
        kernel.wake_one(&mut state.waiters);
        Ok(())
    }

    pub(crate) fn cancel(&self, kernel: &Kernel, tid: ThreadId) {
        let mut state = self.state.lock();
        if !state.waiters.remove(tid) && state.count > 0 {
            kernel.wake_one(&mut state.waiters);
        }
    }
}

impl core::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Semaphore")
            .field("count", &state.count)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
